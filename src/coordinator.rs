//! Single-outcome coordination for one delivered message.
//!
//! A handler may fan a message out into several concurrent sub-tasks, any of
//! which can decide that the whole message must be retried or dead-lettered.
//! The [`Coordinator`] makes sure exactly one outcome is applied:
//!
//! ```text
//!            mark_retry ──> Retrying
//!           /
//! Pending ──── mark_dead_letter ──> DeadLettered
//!           \
//!            finish ──> Acked
//! ```
//!
//! The first transition wins; every later attempt is a no-op that returns
//! `false`. Deciding also cancels the message's [`CancellationToken`] so
//! sub-tasks that are still running can stop early.
//!
//! ## Handler pattern
//!
//! ```rust,ignore
//! async fn handle(&self, batch: Vec<Message<AppMessage>>) {
//!     for message in batch {
//!         let app = message.envelope.message.id;
//!         let progress = message
//!             .coordinator
//!             .stage([
//!                 sub_task(move |c| async move { fetch_store_page(app, c).await }),
//!                 sub_task(move |c| async move { fetch_player_counts(app, c).await }),
//!             ])
//!             .await;
//!         if progress == Progress::Decided {
//!             continue;
//!         }
//!         message.coordinator.guarded(save(app)).await;
//!         message.coordinator.finish().await;
//!     }
//! }
//! ```

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures_core::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Instrument as _;

use crate::{
    Envelope, Headers,
    dedup::DedupKey,
    jobs::Job,
    registry::Registry,
    transport::{Delivery, WireEnvelope},
};

/// Consumer of one job type.
///
/// Every message in the batch must end in exactly one outcome through its
/// [`Coordinator`]. A message the handler never settles stays unacknowledged
/// until the connection drops and the broker redelivers it.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Job: Job;

    async fn handle(&self, batch: Vec<Message<Self::Job>>);
}

/// A decoded job together with its coordinator.
pub struct Message<M> {
    pub envelope: Envelope<Headers, M>,
    pub coordinator: Coordinator,
}

impl<M> Message<M> {
    pub fn payload(&self) -> &M {
        &self.envelope.message
    }

    pub fn headers(&self) -> &Headers {
        &self.envelope.headers
    }
}

/// Final state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Retrying,
    DeadLettered,
    Acked,
}

impl Outcome {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Outcome::Retrying,
            2 => Outcome::DeadLettered,
            3 => Outcome::Acked,
            _ => Outcome::Pending,
        }
    }
}

/// Result of running one [`stage`](Coordinator::stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// All sub-tasks succeeded; the message is still undecided.
    Continue,
    /// An outcome was reached; the handler must stop working on the message.
    Decided,
}

/// Failure reported by a sub-task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Transient failure, the message goes through the delay router.
    #[error("retryable failure: {0}")]
    Retry(tower::BoxError),
    /// Permanent failure, the message goes to the dead-letter queue.
    #[error("permanent failure: {0}")]
    DeadLetter(tower::BoxError),
}

impl TaskError {
    pub fn retry(err: impl Into<tower::BoxError>) -> Self {
        Self::Retry(err.into())
    }

    pub fn dead_letter(err: impl Into<tower::BoxError>) -> Self {
        Self::DeadLetter(err.into())
    }
}

/// A type-erased sub-task, so differently typed closures fit in one stage.
pub type SubTask = Box<dyn FnOnce(Coordinator) -> BoxFuture<'static, Result<(), TaskError>> + Send>;

/// Erase the type of a sub-task closure.
pub fn sub_task<F, Fut>(task: F) -> SubTask
where
    F: FnOnce(Coordinator) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Box::new(move |coordinator| Box::pin(task(coordinator)))
}

/// Decision state for one delivered message. Cloning is cheap.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU8,
    cancel: CancellationToken,
    delivery: Delivery,
    registry: Arc<Registry>,
    dedup: Option<DedupKey>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("queue", &self.inner.delivery.queue)
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub(crate) fn new(delivery: Delivery, registry: Arc<Registry>, dedup: Option<DedupKey>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(Outcome::Pending as u8),
                cancel: CancellationToken::new(),
                delivery,
                registry,
                dedup,
            }),
        }
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_decided(&self) -> bool {
        self.outcome() != Outcome::Pending
    }

    /// Resolves once the message has an outcome.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    /// Send the message through the delay router.
    ///
    /// Returns whether this call decided the outcome.
    pub async fn mark_retry(&self) -> bool {
        self.retry(None).await
    }

    /// Like [`mark_retry`](Coordinator::mark_retry), holding the message in
    /// the router for at least `delay`.
    pub async fn mark_retry_after(&self, delay: Duration) -> bool {
        self.retry(Some(delay)).await
    }

    /// Send the message to the dead-letter queue.
    ///
    /// Returns whether this call decided the outcome.
    pub async fn mark_dead_letter(&self) -> bool {
        if !self.decide(Outcome::DeadLettered) {
            return false;
        }
        let queue = self.inner.registry.settings().dead_letter_queue.clone();
        tracing::warn!(queue = %self.inner.delivery.queue, "Message dead-lettered");
        self.forward(queue, self.inner.delivery.envelope.clone(), true).await;
        true
    }

    /// Acknowledge the message if nothing else decided its outcome.
    ///
    /// Returns whether this call decided the outcome.
    pub async fn finish(&self) -> bool {
        if !self.decide(Outcome::Acked) {
            return false;
        }
        let this = self.clone();
        settle_detached(async move {
            if let Err(error) = this.inner.delivery.ack().await {
                tracing::error!(%error, "Failed to ack message");
            }
            this.clear_marker().await;
        })
        .await;
        true
    }

    /// Run `tasks` concurrently and wait for all of them.
    ///
    /// Each task receives a clone of this coordinator. A failing task marks
    /// the message; a panicking task or a stage running past the configured
    /// stage timeout marks it for retry.
    pub async fn stage<I, T, F>(&self, tasks: I) -> Progress
    where
        I: IntoIterator<Item = T>,
        T: FnOnce(Coordinator) -> F,
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if self.is_decided() {
            return Progress::Decided;
        }

        let mut set = JoinSet::new();
        for task in tasks {
            set.spawn(task(self.clone()));
        }

        let joined = async {
            while let Some(result) = set.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(TaskError::Retry(error))) => {
                        tracing::warn!(%error, "Sub-task failed, retrying message");
                        self.mark_retry().await;
                    }
                    Ok(Err(TaskError::DeadLetter(error))) => {
                        tracing::error!(%error, "Sub-task failed permanently");
                        self.mark_dead_letter().await;
                    }
                    Err(error) if error.is_panic() => {
                        tracing::error!(%error, "Sub-task panicked, retrying message");
                        self.mark_retry().await;
                    }
                    Err(_) => {}
                }
            }
        };

        let timeout = self.inner.registry.settings().stage_timeout;
        if tokio::time::timeout(timeout, joined).await.is_err() {
            tracing::warn!(timeout_ms = %timeout.as_millis(), "Stage timed out, retrying message");
            self.mark_retry().await;
        }
        set.abort_all();

        if self.is_decided() {
            Progress::Decided
        } else {
            Progress::Continue
        }
    }

    /// Run `fut` only while the message is undecided.
    ///
    /// Returns `None` without polling `fut` if an outcome already exists, and
    /// drops `fut` as soon as one is reached.
    pub async fn guarded<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_decided() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            output = fut => Some(output),
        }
    }

    fn decide(&self, outcome: Outcome) -> bool {
        let decided = self
            .inner
            .state
            .compare_exchange(
                Outcome::Pending as u8,
                outcome as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if decided {
            self.inner.cancel.cancel();
        }
        decided
    }

    async fn retry(&self, delay: Option<Duration>) -> bool {
        if !self.decide(Outcome::Retrying) {
            return false;
        }
        let mut envelope = self.inner.delivery.envelope.clone();
        if let Some(delay) = delay {
            envelope.headers.delay_until = TimeDelta::from_std(delay)
                .ok()
                .and_then(|delay| Utc::now().checked_add_signed(delay));
        }
        let queue = self.inner.registry.settings().delay_queue.clone();
        tracing::info!(attempt = envelope.headers.attempt, "Message sent for retry");
        self.forward(queue, envelope, false).await;
        true
    }

    // The delivery is only acked once its replacement is safely published.
    async fn forward(&self, queue: String, envelope: WireEnvelope, clear_marker: bool) {
        let this = self.clone();
        settle_detached(async move {
            let delivery = &this.inner.delivery;
            let settled = match this.inner.registry.publish_envelope(&queue, envelope).await {
                Ok(()) => delivery.ack().await,
                Err(error) => {
                    tracing::error!(%queue, %error, "Failed to forward message, requeueing");
                    delivery.nack(true).await
                }
            };
            if let Err(error) = settled {
                tracing::error!(%error, "Failed to settle message");
            }
            if clear_marker {
                this.clear_marker().await;
            }
        })
        .await;
    }

    async fn clear_marker(&self) {
        if let Some(key) = &self.inner.dedup {
            self.inner.registry.clear_marker(key).await;
        }
    }
}

/// Settle a decided message on its own task.
///
/// Once an outcome is decided the delivery must be settled, even when the
/// caller is dropped by a stage timeout or an aborted sub-task.
async fn settle_detached<F>(settle: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(error) = tokio::spawn(settle.in_current_span()).await {
        tracing::error!(%error, "Settling task failed");
    }
}
