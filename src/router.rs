//! Delayed retry through a dedicated queue.
//!
//! Messages marked for retry are published to the delay queue. The router
//! consumes that queue and, for every message, either bounces it back into
//! the delay queue (not due yet), forwards it to its original queue with the
//! attempt advanced by one, or dead-letters it.
//!
//! The decision itself is the pure function [`route`]; [`DelayRouter`] only
//! applies it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    Headers,
    dispatcher::Consume,
    registry::Registry,
    transport::{Delivery, WireEnvelope},
};

const MIN_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(6 * 60 * 60);

/// Wait before the given attempt: `2^attempt` seconds, clamped to 10 s..6 h.
pub fn backoff(attempt: u32) -> Duration {
    let seconds = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(seconds).clamp(MIN_BACKOFF, MAX_BACKOFF)
}

/// Earliest time the router forwards a message carrying `headers`.
pub fn next_attempt(headers: &Headers) -> DateTime<Utc> {
    let wait = TimeDelta::from_std(backoff(headers.attempt)).unwrap_or(TimeDelta::MAX);
    let scheduled = headers
        .first_seen
        .checked_add_signed(wait)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    match headers.delay_until {
        Some(until) if until > scheduled => until,
        _ => scheduled,
    }
}

/// Retry limits of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub max_age: Option<Duration>,
}

/// What the router does with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Due: send back to the original queue with the next attempt.
    Forward,
    /// Not due yet: publish back into the delay queue unchanged.
    Wait,
    /// Never retry again.
    DeadLetter(DeadLetterReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The message claims to belong to the delay queue itself.
    Loop,
    /// Older than the queue's `max_age`.
    TooOld,
    /// More attempts than the queue's `max_attempts`.
    TooManyAttempts,
}

/// Decide the route of a message sitting in `delay_queue`.
pub fn route(headers: &Headers, delay_queue: &str, policy: RetryPolicy, now: DateTime<Utc>) -> Route {
    if headers.original_queue == delay_queue {
        return Route::DeadLetter(DeadLetterReason::Loop);
    }

    if let Some(max_age) = policy.max_age {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        if now.signed_duration_since(headers.first_seen) > max_age {
            return Route::DeadLetter(DeadLetterReason::TooOld);
        }
    }

    if let Some(max_attempts) = policy.max_attempts {
        if headers.attempt > max_attempts {
            return Route::DeadLetter(DeadLetterReason::TooManyAttempts);
        }
    }

    if now >= next_attempt(headers) {
        Route::Forward
    } else {
        Route::Wait
    }
}

/// Consumer of the delay queue.
pub(crate) struct DelayRouter;

#[async_trait]
impl Consume for DelayRouter {
    async fn consume(&self, batch: Vec<Delivery>, registry: &Arc<Registry>) {
        let pacing = registry.settings().router_pacing;
        for delivery in batch {
            tokio::time::sleep(pacing).await;
            relay(delivery, registry).await;
        }
    }
}

#[tracing::instrument(skip_all, fields(
    original_queue = %delivery.envelope.headers.original_queue,
    attempt = delivery.envelope.headers.attempt,
))]
async fn relay(delivery: Delivery, registry: &Registry) {
    let settings = registry.settings();
    let headers = &delivery.envelope.headers;
    let target = registry.binding(&headers.original_queue).await;
    let policy = target.as_ref().map(|b| b.retry).unwrap_or_default();

    let (queue, envelope) = match route(headers, &settings.delay_queue, policy, Utc::now()) {
        Route::Wait => (settings.delay_queue.clone(), delivery.envelope.clone()),
        Route::Forward => forward(&delivery, registry).await,
        Route::DeadLetter(reason) => {
            tracing::warn!(?reason, "Retry budget exhausted, dead-lettering");
            dead_letter(&delivery, registry).await
        }
    };

    let settled = match registry.publish_envelope(&queue, envelope).await {
        Ok(()) => delivery.ack().await,
        Err(error) => {
            tracing::error!(%queue, %error, "Failed to relay message, requeueing");
            delivery.nack(true).await
        }
    };
    if let Err(error) = settled {
        tracing::error!(%error, "Failed to settle delayed message");
    }
}

// Original queue first, then the last queue the message sat in, then give up.
async fn forward(delivery: &Delivery, registry: &Registry) -> (String, WireEnvelope) {
    let headers = &delivery.envelope.headers;
    let delay_queue = &registry.settings().delay_queue;

    let mut target = registry.binding(&headers.original_queue).await;
    if target.is_none() && headers.last_queue != *delay_queue {
        target = registry.binding(&headers.last_queue).await;
    }
    let Some(target) = target else {
        tracing::warn!(last_queue = %headers.last_queue, "No binding to retry into, dead-lettering");
        return dead_letter(delivery, registry).await;
    };

    let mut envelope = delivery.envelope.clone();
    if let Some(codec) = target.codec {
        match (codec.republish)(&envelope) {
            Ok(republished) => envelope = republished,
            Err(error) => {
                tracing::error!(%error, "Payload no longer decodes, dead-lettering");
                return dead_letter(delivery, registry).await;
            }
        }
    }
    envelope.headers = envelope.headers.next_attempt();

    tracing::debug!(queue = %target.name, attempt = envelope.headers.attempt, "Retrying message");
    (target.name.clone(), envelope)
}

async fn dead_letter(delivery: &Delivery, registry: &Registry) -> (String, WireEnvelope) {
    let headers = &delivery.envelope.headers;
    if let Some(binding) = registry.binding(&headers.original_queue).await {
        if let Some(key) = binding.codec.and_then(|codec| (codec.dedup_key)(&delivery.envelope)) {
            registry.clear_marker(&key).await;
        }
    }
    (
        registry.settings().dead_letter_queue.clone(),
        delivery.envelope.clone(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        Envelope, Settings,
        coordinator::{Handler, Message},
        dedup::MarkerStore as _,
        jobs::AppMessage,
        registry::QueueDefinition,
        testing::Harness,
        transport::RawPayload,
    };

    fn headers_seen_ago(age: TimeDelta, attempt: u32) -> Headers {
        let mut headers = Headers::new("apps", false);
        headers.first_seen = Utc::now() - age;
        headers.attempt = attempt;
        headers
    }

    #[test]
    fn backoff_is_clamped() {
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(4), Duration::from_secs(16));
        assert_eq!(backoff(10), Duration::from_secs(1024));
        assert_eq!(backoff(15), Duration::from_secs(6 * 60 * 60));
        assert_eq!(backoff(200), Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn next_attempt_honours_delay_until() {
        let mut headers = headers_seen_ago(TimeDelta::zero(), 1);
        assert_eq!(next_attempt(&headers), headers.first_seen + TimeDelta::seconds(10));

        let later = headers.first_seen + TimeDelta::hours(1);
        headers.delay_until = Some(later);
        assert_eq!(next_attempt(&headers), later);
    }

    #[test]
    fn route_checks_limits_in_order() {
        let now = Utc::now();
        let policy = RetryPolicy {
            max_attempts: Some(3),
            max_age: Some(Duration::from_secs(24 * 60 * 60)),
        };

        let mut looping = headers_seen_ago(TimeDelta::days(3), 9);
        looping.original_queue = "delay".to_owned();
        assert_eq!(
            route(&looping, "delay", policy, now),
            Route::DeadLetter(DeadLetterReason::Loop)
        );

        let old = headers_seen_ago(TimeDelta::days(2), 9);
        assert_eq!(
            route(&old, "delay", policy, now),
            Route::DeadLetter(DeadLetterReason::TooOld)
        );

        let tired = headers_seen_ago(TimeDelta::hours(1), 4);
        assert_eq!(
            route(&tired, "delay", policy, now),
            Route::DeadLetter(DeadLetterReason::TooManyAttempts)
        );

        let fresh = headers_seen_ago(TimeDelta::seconds(1), 3);
        assert_eq!(route(&fresh, "delay", policy, now), Route::Wait);

        let due = headers_seen_ago(TimeDelta::minutes(5), 3);
        assert_eq!(route(&due, "delay", policy, now), Route::Forward);
        assert_eq!(route(&due, "delay", RetryPolicy::default(), now), Route::Forward);
    }

    /// Retries every delivery and records the attempts it saw.
    struct AlwaysRetry(Arc<std::sync::Mutex<Vec<u32>>>);

    #[async_trait]
    impl Handler for AlwaysRetry {
        type Job = AppMessage;

        async fn handle(&self, batch: Vec<Message<AppMessage>>) {
            for message in batch {
                if let Ok(mut seen) = self.0.lock() {
                    seen.push(message.headers().attempt);
                }
                message.coordinator.mark_retry().await;
            }
        }
    }

    async fn pipeline(apps: QueueDefinition) -> Harness {
        let harness = Harness::new().await;
        let settings = harness.registry.settings().clone();
        harness
            .registry
            .register(
                [
                    apps,
                    QueueDefinition::delay_router(&settings),
                    QueueDefinition::dead_letter(&settings),
                ],
                true,
            )
            .await
            .unwrap();
        harness
    }

    async fn publish_backdated(harness: &Harness, age: TimeDelta) {
        let envelope = Envelope {
            headers: headers_seen_ago(age, 1),
            message: RawPayload::from(r#"{"id":440}"#),
        };
        harness
            .registry
            .publish_envelope("apps", envelope)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_are_bounded_by_max_attempts() {
        let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let harness = pipeline(
            QueueDefinition::consumer(AlwaysRetry(Arc::clone(&attempts))).with_max_attempts(3),
        )
        .await;
        let key = crate::dedup::DedupKey::new("app", 440);
        harness
            .markers
            .set(&key, Duration::from_secs(60))
            .await
            .unwrap();

        publish_backdated(&harness, TimeDelta::hours(1)).await;

        harness
            .eventually(|| async { harness.broker.published("failed").await == 1 })
            .await;
        harness.registry.shutdown().await;

        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(harness.broker.published("delay").await, 4);
        assert_eq!(harness.broker.published("apps").await, 4);

        let failed = &harness.broker.queued("failed").await[0];
        assert_eq!(failed.headers.attempt, 4);
        assert_eq!(failed.headers.original_queue, "apps");
        assert!(!harness.markers.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn old_messages_are_dead_lettered() {
        let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let harness = pipeline(
            QueueDefinition::consumer(AlwaysRetry(Arc::clone(&attempts)))
                .with_max_age(Duration::from_secs(24 * 60 * 60)),
        )
        .await;

        publish_backdated(&harness, TimeDelta::days(2)).await;

        harness
            .eventually(|| async { harness.broker.published("failed").await == 1 })
            .await;
        harness.registry.shutdown().await;

        assert_eq!(*attempts.lock().unwrap(), vec![1]);
        assert_eq!(harness.broker.published("apps").await, 1);
    }

    #[tokio::test]
    async fn router_never_forwards_into_itself() {
        let harness = pipeline(QueueDefinition::job::<AppMessage>()).await;

        let mut headers = headers_seen_ago(TimeDelta::hours(1), 1);
        headers.original_queue = "delay".to_owned();
        harness
            .registry
            .publish_envelope(
                "delay",
                Envelope {
                    headers,
                    message: RawPayload::from("{}"),
                },
            )
            .await
            .unwrap();

        harness
            .eventually(|| async { harness.broker.published("failed").await == 1 })
            .await;
        harness.registry.shutdown().await;
        assert_eq!(harness.broker.published("delay").await, 1);
        assert_eq!(harness.broker.acked("delay").await, 1);
    }

    #[tokio::test]
    async fn messages_not_due_bounce_unchanged() {
        let harness = pipeline(QueueDefinition::job::<AppMessage>()).await;

        let headers = headers_seen_ago(TimeDelta::zero(), 1);
        let sent = headers.clone();
        harness
            .registry
            .publish_envelope(
                "delay",
                Envelope {
                    headers,
                    message: RawPayload::from(r#"{"id":440}"#),
                },
            )
            .await
            .unwrap();

        harness
            .eventually(|| async { harness.broker.published("delay").await >= 3 })
            .await;
        harness.registry.shutdown().await;

        assert_eq!(harness.broker.published("apps").await, 0);
        for queued in harness.broker.queued("delay").await {
            assert_eq!(queued.headers, sent);
        }
    }

    #[tokio::test]
    async fn unknown_origin_falls_back_to_last_queue() {
        let seen = Arc::new(AtomicU32::new(0));

        struct Attempt(Arc<AtomicU32>);

        #[async_trait]
        impl Handler for Attempt {
            type Job = AppMessage;

            async fn handle(&self, batch: Vec<Message<AppMessage>>) {
                for message in batch {
                    self.0.store(message.headers().attempt, Ordering::SeqCst);
                    message.coordinator.finish().await;
                }
            }
        }

        let harness = pipeline(QueueDefinition::consumer(Attempt(Arc::clone(&seen)))).await;

        let mut headers = headers_seen_ago(TimeDelta::hours(1), 2);
        headers.original_queue = "retired".to_owned();
        headers.last_queue = "apps".to_owned();
        harness
            .registry
            .publish_envelope(
                "delay",
                Envelope {
                    headers,
                    message: RawPayload::from(r#"{"id":440}"#),
                },
            )
            .await
            .unwrap();

        harness
            .eventually(|| async { seen.load(Ordering::SeqCst) == 3 })
            .await;
        harness.registry.shutdown().await;
        assert_eq!(harness.broker.published("failed").await, 0);
    }

    #[tokio::test]
    async fn stale_payload_is_dead_lettered_on_forward() {
        let harness = pipeline(QueueDefinition::job::<AppMessage>()).await;

        let headers = headers_seen_ago(TimeDelta::hours(1), 1);
        harness
            .registry
            .publish_envelope(
                "delay",
                Envelope {
                    headers,
                    message: RawPayload::from(r#"{"app":"renamed field"}"#),
                },
            )
            .await
            .unwrap();

        harness
            .eventually(|| async { harness.broker.published("failed").await == 1 })
            .await;
        harness.registry.shutdown().await;
        assert_eq!(harness.broker.published("apps").await, 0);
    }

    #[tokio::test]
    async fn publish_failure_requeues_delivery() {
        let harness = Harness::new().await;
        let settings = Settings {
            dead_letter_queue: "missing".to_owned(),
            ..harness.registry.settings().clone()
        };
        let registry = Registry::new(
            crate::transport::Transport::new(harness.consumer.clone()).boxed(),
            Arc::new(harness.consumer.clone()),
            Arc::new(harness.markers.clone()),
            settings.clone(),
        );
        registry
            .register(
                [QueueDefinition::new(settings.delay_queue.clone()).skip_headers()],
                false,
            )
            .await
            .unwrap();

        let mut headers = headers_seen_ago(TimeDelta::hours(1), 1);
        headers.original_queue = "delay".to_owned();
        registry
            .publish_envelope(
                "delay",
                Envelope {
                    headers,
                    message: RawPayload::from("{}"),
                },
            )
            .await
            .unwrap();

        let delivery = harness.next_delivery("delay").await;
        relay(delivery, &registry).await;

        assert_eq!(harness.broker.nacked("delay").await, 1);
        assert_eq!(harness.broker.queued("delay").await.len(), 1);
    }
}
