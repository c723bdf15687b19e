//! Per-entity "already queued" markers.
//!
//! A marker is written right after a job is published and removed once the
//! job is acknowledged or dead-lettered. Markers expire on their own, so a
//! crashed worker only blocks re-queuing its entity for the marker TTL.
//!
//! The check and the publish are not atomic: two producers racing on the same
//! entity may both publish. Markers reduce duplicate work, they do not
//! prevent it.

mod inmemory;

#[cfg(feature = "redis")]
pub mod redis;

use std::{fmt, time::Duration};

use async_trait::async_trait;

pub use inmemory::InMemoryMarkers;

/// Default lifetime of a marker.
pub const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(60 * 60);

/// Identifies one entity of one job kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    kind: &'static str,
    id: String,
}

impl DedupKey {
    pub fn new(kind: &'static str, id: impl fmt::Display) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-in-queue-{}", self.kind, self.id)
    }
}

/// Storage for dedup markers.
#[async_trait]
pub trait MarkerStore: Send + Sync + 'static {
    /// Whether an unexpired marker exists for `key`.
    async fn exists(&self, key: &DedupKey) -> Result<bool, tower::BoxError>;

    /// Write the marker for `key`, replacing any previous expiry.
    async fn set(&self, key: &DedupKey, ttl: Duration) -> Result<(), tower::BoxError>;

    /// Remove the marker for `key`. Removing a missing marker is not an error.
    async fn clear(&self, key: &DedupKey) -> Result<(), tower::BoxError>;
}
