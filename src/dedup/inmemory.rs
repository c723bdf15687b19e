use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{DedupKey, MarkerStore};

/// Process-local marker store.
///
/// Expiry follows `tokio::time`, so paused-clock tests can step over a TTL.
#[derive(Clone, Default)]
pub struct InMemoryMarkers {
    markers: Arc<Mutex<HashMap<String, Instant>>>,
}

impl InMemoryMarkers {
    /// Number of unexpired markers.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let markers = self.markers.lock().await;
        markers.values().filter(|expiry| **expiry > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MarkerStore for InMemoryMarkers {
    async fn exists(&self, key: &DedupKey) -> Result<bool, tower::BoxError> {
        let mut markers = self.markers.lock().await;
        let key = key.to_string();
        match markers.get(&key) {
            Some(expiry) if *expiry > Instant::now() => Ok(true),
            Some(_) => {
                markers.remove(&key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn set(&self, key: &DedupKey, ttl: Duration) -> Result<(), tower::BoxError> {
        let mut markers = self.markers.lock().await;
        markers.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn clear(&self, key: &DedupKey) -> Result<(), tower::BoxError> {
        let mut markers = self.markers.lock().await;
        markers.remove(&key.to_string());
        Ok(())
    }
}
