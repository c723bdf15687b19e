//! Consumer loops feeding batches to handlers.
//!
//! Each consuming binding gets one loop per configured consumer. A loop:
//!
//! - Consumes its queue with the binding's prefetch
//! - Groups deliveries into batches of up to `batch_size`
//! - Hands each batch to the binding's consumer
//! - Resumes consuming with backoff whenever the delivery stream ends
//! - Stops when the registry shuts down
//!
//! The loop never acknowledges anything itself; settling is the job of the
//! [`Coordinator`](crate::Coordinator) attached to each message.

use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder as _, ExponentialBuilder, ExponentialBackoff};
use tokio_stream::StreamExt as _;

use crate::{
    codec,
    coordinator::{Coordinator, Handler, Message},
    jobs::Job,
    registry::{QueueDefinition, Registry},
    transport::Delivery,
};

/// Receives the raw deliveries of one batch.
#[async_trait]
pub(crate) trait Consume: Send + Sync + 'static {
    async fn consume(&self, batch: Vec<Delivery>, registry: &Arc<Registry>);
}

/// Decodes deliveries for a typed [`Handler`].
pub(crate) struct TypedConsumer<H> {
    handler: H,
}

impl<H> TypedConsumer<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: Handler> Consume for TypedConsumer<H> {
    async fn consume(&self, batch: Vec<Delivery>, registry: &Arc<Registry>) {
        let mut messages = Vec::with_capacity(batch.len());
        for delivery in batch {
            match codec::decode::<H::Job>(&delivery.envelope) {
                Ok(envelope) => {
                    let dedup = envelope.message.dedup_key();
                    let coordinator = Coordinator::new(delivery, Arc::clone(registry), dedup);
                    messages.push(Message {
                        envelope,
                        coordinator,
                    });
                }
                Err(error) => {
                    registry.hook().on_decode_error(&delivery.queue, &error);
                    Coordinator::new(delivery, Arc::clone(registry), None)
                        .mark_dead_letter()
                        .await;
                }
            }
        }

        if !messages.is_empty() {
            self.handler.handle(messages).await;
        }
    }
}

/// Run one dispatcher loop until the registry shuts down.
#[tracing::instrument(skip_all, fields(queue = %binding.name, worker = worker))]
pub(crate) async fn run(
    registry: Arc<Registry>,
    binding: Arc<QueueDefinition>,
    consumer: Arc<dyn Consume>,
    worker: usize,
) {
    let hook = Arc::clone(registry.hook());
    let shutdown = registry.shutdown_token().clone();
    let settings = registry.settings().clone();
    let queue = binding.name.as_str();
    let backoff = || -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(settings.resubscribe_min)
            .with_max_delay(settings.resubscribe_max)
            .with_jitter()
            .without_max_times()
            .build()
    };
    let mut delays = backoff();

    hook.on_startup(queue);

    loop {
        let consumed = tokio::select! {
            _ = shutdown.cancelled() => break,
            consumed = registry.receiver().consume(queue, binding.prefetch) => consumed,
        };

        match consumed {
            Ok(stream) => {
                delays = backoff();
                let batches = stream.chunks_timeout(binding.batch_size, settings.batch_window);
                tokio::pin!(batches);

                loop {
                    let batch = tokio::select! {
                        _ = shutdown.cancelled() => {
                            hook.on_shutdown(queue);
                            return;
                        }
                        batch = batches.next() => batch,
                    };
                    let Some(batch) = batch else {
                        hook.on_stream_end(queue);
                        break;
                    };

                    let mut deliveries = Vec::with_capacity(batch.len());
                    for item in batch {
                        match item {
                            Ok(delivery) => deliveries.push(delivery),
                            Err(error) => hook.on_consume_error(queue, &error),
                        }
                    }
                    if deliveries.is_empty() {
                        continue;
                    }

                    hook.on_batch(queue, deliveries.len());
                    consumer.consume(deliveries, &registry).await;
                }
            }
            Err(error) => hook.on_consume_error(queue, &error),
        }

        let delay = delays.next().unwrap_or(settings.resubscribe_max);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    hook.on_shutdown(queue);
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait DispatcherHook: Send + Sync {
    fn on_startup(&self, queue: &str);
    fn on_shutdown(&self, queue: &str);
    fn on_batch(&self, queue: &str, size: usize);
    fn on_consume_error(&self, queue: &str, error: &dyn std::error::Error);
    fn on_decode_error(&self, queue: &str, error: &dyn std::error::Error);
    fn on_stream_end(&self, queue: &str);
}

/// Default dispatcher hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultDispatcherHook;

impl DispatcherHook for DefaultDispatcherHook {
    fn on_startup(&self, queue: &str) {
        tracing::info!(%queue, "Dispatcher is starting up");
    }

    fn on_shutdown(&self, queue: &str) {
        tracing::info!(%queue, "Dispatcher is shutting down");
    }

    fn on_batch(&self, queue: &str, size: usize) {
        tracing::debug!(%queue, size, "Batch received");
    }

    fn on_consume_error(&self, queue: &str, error: &dyn std::error::Error) {
        tracing::warn!(%queue, %error, "Error consuming queue");
    }

    fn on_decode_error(&self, queue: &str, error: &dyn std::error::Error) {
        tracing::error!(%queue, %error, "Undecodable message, dead-lettering");
    }

    fn on_stream_end(&self, queue: &str) {
        tracing::warn!(%queue, "Delivery stream ended, resubscribing");
    }
}
