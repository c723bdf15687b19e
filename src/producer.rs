//! Typed enqueue functions guarded by dedup markers.
//!
//! Every enqueue goes through the same steps:
//!
//! - Validate (and normalize) the job
//! - Unless forced, refuse if a marker says the entity is already queued
//! - Publish through the [`Registry`]
//! - Write the marker for the entity
//!
//! The marker check and the publish are not atomic, see [`crate::dedup`].

use std::{sync::Arc, time::Duration};

use tracing_error::SpanTrace;

use crate::{
    dedup::{DedupKey, MarkerStore},
    jobs::{
        AppMessage, BundleMessage, ChangesMessage, GroupMessage, Job, PackageMessage,
        PlayerMessage, Rejected,
    },
    registry::{Registry, RegistryError},
};

/// Publishes jobs on behalf of web requests, cron tasks and other handlers.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct Producer {
    registry: Arc<Registry>,
    markers: Arc<dyn MarkerStore>,
    marker_ttl: Duration,
}

impl Producer {
    /// Create a producer publishing through `registry` and sharing its marker store.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            markers: Arc::clone(registry.markers()),
            marker_ttl: registry.settings().marker_ttl,
            registry,
        }
    }

    /// Enqueue any job kind.
    ///
    /// Kinds with a dedup key are refused with
    /// [`ProduceErrorKind::AlreadyQueued`] while their marker exists, unless
    /// `force` is set or the job itself bypasses dedup.
    #[tracing::instrument(skip(self, job), fields(queue = M::QUEUE))]
    pub async fn enqueue<M: Job>(&self, mut job: M, force: bool) -> Result<(), ProduceError> {
        job.validate().map_err(ProduceError::rejected)?;

        let key = job.dedup_key();
        if let Some(key) = &key {
            if !force && !job.bypasses_dedup() {
                let queued = self.markers.exists(key).await.map_err(ProduceError::markers)?;
                if queued {
                    tracing::debug!(marker = %key, "Entity already queued");
                    return Err(ProduceError::already_queued(key));
                }
            }
        }

        self.registry
            .publish(M::QUEUE, &job, force)
            .await
            .map_err(ProduceError::registry)?;

        if let Some(key) = &key {
            self.markers
                .set(key, self.marker_ttl)
                .await
                .map_err(ProduceError::markers)?;
        }
        Ok(())
    }

    pub async fn enqueue_app(&self, id: u32, force: bool) -> Result<(), ProduceError> {
        let job = AppMessage {
            id,
            change_number: None,
        };
        self.enqueue(job, force).await
    }

    pub async fn enqueue_package(&self, id: u32, force: bool) -> Result<(), ProduceError> {
        let job = PackageMessage {
            id,
            change_number: None,
        };
        self.enqueue(job, force).await
    }

    pub async fn enqueue_bundle(&self, id: u32, force: bool) -> Result<(), ProduceError> {
        self.enqueue(BundleMessage { id }, force).await
    }

    /// `id` may be a 64-bit SteamID or a 32-bit account id.
    pub async fn enqueue_player(&self, id: u64, force: bool) -> Result<(), ProduceError> {
        let job = PlayerMessage {
            id,
            ..Default::default()
        };
        self.enqueue(job, force).await
    }

    pub async fn enqueue_group(&self, id: impl Into<String>, force: bool) -> Result<(), ProduceError> {
        let job = GroupMessage {
            id: id.into(),
            user_agent: None,
        };
        self.enqueue(job, force).await
    }

    /// Enqueue a change-feed batch. Change batches are never deduplicated.
    pub async fn enqueue_changes(&self, changes: ChangesMessage) -> Result<(), ProduceError> {
        self.enqueue(changes, false).await
    }
}

/// Error returned when a job could not be enqueued.
#[derive(Debug)]
pub struct ProduceError {
    context: SpanTrace,
    kind: ProduceErrorKind,
}

/// Classification of enqueue errors.
#[derive(Debug)]
pub enum ProduceErrorKind {
    /// A marker exists for the entity; nothing was published.
    AlreadyQueued(DedupKey),
    /// The job failed validation; nothing was published.
    Invalid(Rejected),
    /// The request came from a crawler; nothing was published.
    Bot,
    /// Publishing failed.
    Registry(RegistryError),
    /// The marker store failed.
    Markers(tower::BoxError),
}

impl ProduceError {
    fn new(kind: ProduceErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn already_queued(key: &DedupKey) -> Self {
        Self::new(ProduceErrorKind::AlreadyQueued(key.clone()))
    }

    fn rejected(rejected: Rejected) -> Self {
        match rejected {
            Rejected::Bot => Self::new(ProduceErrorKind::Bot),
            invalid => Self::new(ProduceErrorKind::Invalid(invalid)),
        }
    }

    fn registry(err: RegistryError) -> Self {
        Self::new(ProduceErrorKind::Registry(err))
    }

    fn markers(err: tower::BoxError) -> Self {
        Self::new(ProduceErrorKind::Markers(err))
    }

    pub fn kind(&self) -> &ProduceErrorKind {
        &self.kind
    }

    pub fn is_already_queued(&self) -> bool {
        matches!(self.kind, ProduceErrorKind::AlreadyQueued(_))
    }
}

impl std::fmt::Display for ProduceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProduceErrorKind::AlreadyQueued(key) => writeln!(f, "Already queued: {key}"),
            ProduceErrorKind::Invalid(err) => writeln!(f, "Invalid job: {err}"),
            ProduceErrorKind::Bot => writeln!(f, "Bots can't queue refreshes"),
            ProduceErrorKind::Registry(err) => writeln!(f, "Registry error: {err}"),
            ProduceErrorKind::Markers(err) => writeln!(f, "Marker store error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProduceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProduceErrorKind::AlreadyQueued(_) | ProduceErrorKind::Bot => None,
            ProduceErrorKind::Invalid(err) => Some(err),
            ProduceErrorKind::Registry(err) => Some(err),
            ProduceErrorKind::Markers(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::QueueDefinition, testing::Harness};

    async fn producer() -> (Harness, Producer) {
        let harness = Harness::new().await;
        harness
            .registry
            .register(
                [
                    QueueDefinition::job::<AppMessage>(),
                    QueueDefinition::job::<PlayerMessage>(),
                    QueueDefinition::job::<GroupMessage>(),
                    QueueDefinition::job::<ChangesMessage>(),
                ],
                false,
            )
            .await
            .unwrap();
        let producer = Producer::new(Arc::clone(&harness.registry));
        (harness, producer)
    }

    #[tokio::test]
    async fn second_enqueue_is_already_queued() {
        let (harness, producer) = producer().await;

        producer.enqueue_app(440, false).await.unwrap();
        let err = producer.enqueue_app(440, false).await.unwrap_err();

        assert!(err.is_already_queued());
        assert_eq!(harness.broker.published("apps").await, 1);
        assert!(harness.markers.exists(&DedupKey::new("app", 440)).await.unwrap());
    }

    #[tokio::test]
    async fn force_skips_the_marker_check() {
        let (harness, producer) = producer().await;

        producer.enqueue_app(440, false).await.unwrap();
        producer.enqueue_app(440, true).await.unwrap();

        let queued = harness.broker.queued("apps").await;
        assert_eq!(queued.len(), 2);
        assert!(queued[1].headers.force);
    }

    #[tokio::test]
    async fn change_feed_refresh_bypasses_marker() {
        let (harness, producer) = producer().await;

        producer.enqueue_app(10, false).await.unwrap();
        let job = AppMessage {
            id: 10,
            change_number: Some(42),
        };
        producer.enqueue(job, false).await.unwrap();

        assert_eq!(harness.broker.published("apps").await, 2);
    }

    #[tokio::test]
    async fn invalid_and_bot_jobs_are_not_published() {
        let (harness, producer) = producer().await;

        let err = producer.enqueue_app(0, false).await.unwrap_err();
        assert!(matches!(err.kind(), ProduceErrorKind::Invalid(_)));

        let err = producer.enqueue_group("not-a-group", false).await.unwrap_err();
        assert!(matches!(err.kind(), ProduceErrorKind::Invalid(_)));

        let bot = PlayerMessage {
            id: 76561197960287930,
            user_agent: Some("Mozilla/5.0 (compatible; bingbot/2.0)".to_owned()),
            ..Default::default()
        };
        let err = producer.enqueue(bot, false).await.unwrap_err();
        assert!(matches!(err.kind(), ProduceErrorKind::Bot));

        assert_eq!(harness.broker.published("apps").await, 0);
        assert_eq!(harness.broker.published("players").await, 0);
        assert!(harness.markers.is_empty().await);
    }

    #[tokio::test]
    async fn player_account_ids_are_normalized_before_dedup() {
        let (harness, producer) = producer().await;

        producer.enqueue_player(22202, false).await.unwrap();
        let err = producer
            .enqueue_player(76561197960287930, false)
            .await
            .unwrap_err();

        assert!(err.is_already_queued());
        assert_eq!(harness.broker.published("players").await, 1);
    }

    #[tokio::test]
    async fn changes_are_never_deduplicated() {
        let (harness, producer) = producer().await;
        let mut changes = ChangesMessage::default();
        changes.app_ids.insert(440, 1);

        producer.enqueue_changes(changes.clone()).await.unwrap();
        producer.enqueue_changes(changes).await.unwrap();

        assert_eq!(harness.broker.published("changes").await, 2);
        assert!(harness.markers.is_empty().await);
    }

    #[tokio::test]
    async fn unbound_queue_fails_without_marker() {
        let (harness, producer) = producer().await;

        let err = producer.enqueue_bundle(7, false).await.unwrap_err();

        assert!(matches!(err.kind(), ProduceErrorKind::Registry(_)));
        assert!(harness.markers.is_empty().await);
    }
}
