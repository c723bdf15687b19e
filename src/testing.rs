//! Shared fixtures for unit tests.

use std::{future::Future, sync::Arc, time::Duration};

use tokio_stream::StreamExt as _;

use crate::{
    QueueDefinition, Registry, Settings,
    connection::{ConnectionManager, ReconnectPolicy, Role},
    dedup::InMemoryMarkers,
    jobs::AppMessage,
    transport::{Delivery, InMemoryBroker, Receiver as _, Transport},
};

pub(crate) struct Harness {
    pub broker: InMemoryBroker,
    pub markers: InMemoryMarkers,
    pub registry: Arc<Registry>,
    pub consumer: ConnectionManager<InMemoryBroker>,
}

impl Harness {
    /// Settings with short timings so loops turn over quickly.
    pub fn settings() -> Settings {
        Settings {
            batch_window: Duration::from_millis(10),
            router_pacing: Duration::from_millis(1),
            resubscribe_min: Duration::from_millis(10),
            resubscribe_max: Duration::from_millis(50),
            ..Settings::default()
        }
    }

    pub fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            cool_down: Duration::from_millis(10),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
        }
    }

    /// A connected registry with nothing bound.
    pub async fn new() -> Self {
        Self::unbound(Self::settings()).await
    }

    /// Bindings for `apps`, a non-consuming delay queue and the dead-letter queue.
    pub async fn bound() -> Self {
        Self::with_settings(Self::settings()).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        let harness = Self::unbound(settings).await;
        let settings = harness.registry.settings().clone();
        harness
            .registry
            .register(
                [
                    QueueDefinition::job::<AppMessage>(),
                    QueueDefinition::new(settings.delay_queue.clone()).skip_headers(),
                    QueueDefinition::dead_letter(&settings),
                ],
                false,
            )
            .await
            .unwrap();
        harness
    }

    async fn unbound(settings: Settings) -> Self {
        let broker = InMemoryBroker::default();
        let markers = InMemoryMarkers::default();

        let producer =
            ConnectionManager::new(broker.clone(), "memory://", Role::Producer, Self::policy());
        let consumer =
            ConnectionManager::new(broker.clone(), "memory://", Role::Consumer, Self::policy());
        producer.connect().await.unwrap();
        consumer.connect().await.unwrap();

        let registry = Registry::new(
            Transport::new(producer).boxed(),
            Arc::new(consumer.clone()),
            Arc::new(markers.clone()),
            settings,
        );

        Self {
            broker,
            markers,
            registry,
            consumer,
        }
    }

    /// Take the next message from `queue` without going through a dispatcher.
    pub async fn next_delivery(&self, queue: &str) -> Delivery {
        let mut stream = self.consumer.consume(queue, 1).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    /// Poll `check` until it holds or a second has passed.
    pub async fn eventually<F, Fut>(&self, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
