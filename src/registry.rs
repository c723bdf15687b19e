//! Queue bindings and the publish path.
//!
//! The [`Registry`] is built once at startup and shared by producers,
//! dispatchers, coordinators and the delay router. It knows every queue the
//! process talks to, how to publish to it, and (for consuming processes)
//! owns the dispatcher tasks.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope, Headers,
    codec::{self, CodecError},
    coordinator::Handler,
    dedup::{DEFAULT_MARKER_TTL, DedupKey, MarkerStore},
    dispatcher::{self, Consume, DefaultDispatcherHook, DispatcherHook, TypedConsumer},
    jobs::Job,
    router::{DelayRouter, RetryPolicy},
    transport::{PublishService, Receiver, Transport, TransportError, WireEnvelope},
};

/// Engine-wide settings shared by every binding.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Queue consumed by the delay router.
    pub delay_queue: String,
    /// Queue receiving messages that will never be retried.
    pub dead_letter_queue: String,
    /// How long a dispatcher waits to fill a batch.
    pub batch_window: Duration,
    /// Upper bound for one coordinator stage; exceeding it means retry.
    pub stage_timeout: Duration,
    /// Pause before the delay router handles each delivery.
    pub router_pacing: Duration,
    /// Lifetime of dedup markers.
    pub marker_ttl: Duration,
    /// Bounds of the backoff between attempts to resume consuming.
    pub resubscribe_min: Duration,
    pub resubscribe_max: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            delay_queue: "delay".to_owned(),
            dead_letter_queue: "failed".to_owned(),
            batch_window: Duration::from_millis(100),
            stage_timeout: Duration::from_secs(300),
            router_pacing: Duration::from_millis(100),
            marker_ttl: DEFAULT_MARKER_TTL,
            resubscribe_min: Duration::from_millis(500),
            resubscribe_max: Duration::from_secs(30),
        }
    }
}

/// Decode-and-re-encode hooks for one job type, used when a message is
/// forwarded out of the delay router.
#[derive(Clone, Copy)]
pub(crate) struct JobCodec {
    pub(crate) republish: fn(&WireEnvelope) -> Result<WireEnvelope, CodecError>,
    pub(crate) dedup_key: fn(&WireEnvelope) -> Option<DedupKey>,
}

impl JobCodec {
    fn of<M: Job>() -> Self {
        Self {
            republish: |envelope| codec::encode(&codec::decode::<M>(envelope)?),
            dedup_key: |envelope| {
                codec::decode::<M>(envelope)
                    .ok()
                    .and_then(|typed| typed.message.dedup_key())
            },
        }
    }
}

/// Static description of one queue.
#[derive(Clone)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) batch_size: usize,
    pub(crate) prefetch: u16,
    pub(crate) skip_headers: bool,
    pub(crate) consumers: usize,
    pub(crate) retry: RetryPolicy,
    pub(crate) consumer: Option<Arc<dyn Consume>>,
    pub(crate) codec: Option<JobCodec>,
}

impl std::fmt::Debug for QueueDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDefinition")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("prefetch", &self.prefetch)
            .field("skip_headers", &self.skip_headers)
            .field("consumers", &self.consumers)
            .field("retry", &self.retry)
            .field("consumes", &self.consumer.is_some())
            .finish()
    }
}

impl QueueDefinition {
    /// A queue carrying raw payloads and no handler.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: 10,
            prefetch: 50,
            skip_headers: false,
            consumers: 1,
            retry: RetryPolicy::default(),
            consumer: None,
            codec: None,
        }
    }

    /// A producer-only queue for job type `M`.
    pub fn job<M: Job>() -> Self {
        Self {
            codec: Some(JobCodec::of::<M>()),
            ..Self::new(M::QUEUE)
        }
    }

    /// A queue for the handler's job type, consumed by `handler`.
    pub fn consumer<H: Handler>(handler: H) -> Self {
        Self {
            consumer: Some(Arc::new(TypedConsumer::new(handler))),
            ..Self::job::<H::Job>()
        }
    }

    /// The delay router's own queue, named by [`Settings::delay_queue`].
    pub fn delay_router(settings: &Settings) -> Self {
        Self {
            consumer: Some(Arc::new(DelayRouter)),
            ..Self::new(settings.delay_queue.clone()).skip_headers()
        }
    }

    /// The dead-letter sink, named by [`Settings::dead_letter_queue`].
    pub fn dead_letter(settings: &Settings) -> Self {
        Self::new(settings.dead_letter_queue.clone()).skip_headers()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Pass headers through verbatim instead of stamping them on publish.
    pub fn skip_headers(mut self) -> Self {
        self.skip_headers = true;
        self
    }

    /// Number of dispatcher loops consuming this queue.
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers.max(1);
        self
    }

    /// Dead-letter once the delay router sees an attempt above `max_attempts`.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = Some(max_attempts);
        self
    }

    /// Dead-letter once the message is older than `max_age`.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.retry.max_age = Some(max_age);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of queue bindings.
pub struct Registry {
    transport: Transport<PublishService>,
    receiver: Arc<dyn Receiver>,
    markers: Arc<dyn MarkerStore>,
    settings: Settings,
    hook: Arc<dyn DispatcherHook>,
    bindings: RwLock<HashMap<String, Arc<QueueDefinition>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(
        transport: Transport<PublishService>,
        receiver: Arc<dyn Receiver>,
        markers: Arc<dyn MarkerStore>,
        settings: Settings,
    ) -> Arc<Self> {
        Self::with_hook(transport, receiver, markers, settings, DefaultDispatcherHook)
    }

    /// Like [`new`](Registry::new), reporting dispatcher lifecycle events to `hook`.
    pub fn with_hook(
        transport: Transport<PublishService>,
        receiver: Arc<dyn Receiver>,
        markers: Arc<dyn MarkerStore>,
        settings: Settings,
        hook: impl DispatcherHook + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            receiver,
            markers,
            settings,
            hook: Arc::new(hook),
            bindings: RwLock::default(),
            dispatchers: Mutex::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind `definitions`, and start their dispatchers when `consume` is set.
    ///
    /// Fails without binding anything if a name is already bound or repeated.
    #[tracing::instrument(skip_all, fields(consume = consume))]
    pub async fn register(
        self: &Arc<Self>,
        definitions: impl IntoIterator<Item = QueueDefinition>,
        consume: bool,
    ) -> Result<(), RegistryError> {
        let definitions: Vec<_> = definitions.into_iter().map(Arc::new).collect();

        {
            let mut bindings = self.bindings.write().await;
            for (i, definition) in definitions.iter().enumerate() {
                let repeated = definitions[..i].iter().any(|d| d.name == definition.name);
                if repeated || bindings.contains_key(&definition.name) {
                    return Err(RegistryError::duplicate(&definition.name));
                }
            }
            for definition in &definitions {
                bindings.insert(definition.name.clone(), Arc::clone(definition));
                tracing::debug!(queue = %definition.name, "Queue bound");
            }
        }

        if !consume {
            return Ok(());
        }

        let mut dispatchers = self.dispatchers.lock().await;
        for definition in definitions {
            let Some(consumer) = definition.consumer.clone() else {
                continue;
            };
            for worker in 0..definition.consumers {
                dispatchers.push(tokio::spawn(dispatcher::run(
                    Arc::clone(self),
                    Arc::clone(&definition),
                    Arc::clone(&consumer),
                    worker,
                )));
            }
        }
        Ok(())
    }

    /// Publish a new job to `queue` with fresh headers.
    #[tracing::instrument(skip(self, payload))]
    pub async fn publish<M: Serialize>(
        &self,
        queue: &str,
        payload: &M,
        force: bool,
    ) -> Result<(), RegistryError> {
        let envelope = Envelope {
            headers: Headers::new(queue, force),
            message: payload,
        };
        let wire = codec::encode(&envelope).map_err(RegistryError::codec)?;
        self.publish_envelope(queue, wire).await
    }

    /// Publish an existing wire envelope to `queue`.
    ///
    /// Unless the binding skips headers, `last_queue` is set to `queue` and
    /// an empty `original_queue` is filled in.
    pub async fn publish_envelope(
        &self,
        queue: &str,
        mut envelope: WireEnvelope,
    ) -> Result<(), RegistryError> {
        let binding = self
            .binding(queue)
            .await
            .ok_or_else(|| RegistryError::unknown_queue(queue))?;

        if !binding.skip_headers {
            envelope.headers.stamp(queue);
        }

        self.transport
            .send(queue, envelope)
            .await
            .map_err(RegistryError::transport)
    }

    /// Stop every dispatcher and wait for in-flight batches to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let dispatchers = std::mem::take(&mut *self.dispatchers.lock().await);
        for dispatcher in dispatchers {
            if let Err(error) = dispatcher.await {
                tracing::error!(%error, "Dispatcher task failed");
            }
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) async fn binding(&self, queue: &str) -> Option<Arc<QueueDefinition>> {
        self.bindings.read().await.get(queue).cloned()
    }

    pub(crate) fn markers(&self) -> &Arc<dyn MarkerStore> {
        &self.markers
    }

    pub(crate) fn receiver(&self) -> &Arc<dyn Receiver> {
        &self.receiver
    }

    pub(crate) fn hook(&self) -> &Arc<dyn DispatcherHook> {
        &self.hook
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Best-effort removal of a dedup marker.
    pub(crate) async fn clear_marker(&self, key: &DedupKey) {
        if let Err(error) = self.markers.clear(key).await {
            tracing::warn!(marker = %key, %error, "Failed to clear dedup marker");
        }
    }
}

/// Error returned by registry operations.
#[derive(Debug)]
pub struct RegistryError {
    context: SpanTrace,
    kind: RegistryErrorKind,
}

/// Registry errors kind.
#[derive(Debug)]
pub enum RegistryErrorKind {
    /// No binding exists for the queue.
    UnknownQueue(String),
    /// A binding with this name already exists.
    Duplicate(String),
    /// The payload could not be encoded.
    Codec(CodecError),
    /// The broker refused or failed the publish.
    Transport(TransportError),
}

impl RegistryError {
    fn new(kind: RegistryErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn unknown_queue(queue: &str) -> Self {
        Self::new(RegistryErrorKind::UnknownQueue(queue.to_owned()))
    }

    fn duplicate(queue: &str) -> Self {
        Self::new(RegistryErrorKind::Duplicate(queue.to_owned()))
    }

    fn codec(err: CodecError) -> Self {
        Self::new(RegistryErrorKind::Codec(err))
    }

    fn transport(err: TransportError) -> Self {
        Self::new(RegistryErrorKind::Transport(err))
    }

    pub fn kind(&self) -> &RegistryErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RegistryErrorKind::UnknownQueue(queue) => writeln!(f, "No binding for queue {queue}"),
            RegistryErrorKind::Duplicate(queue) => writeln!(f, "Queue {queue} is already bound"),
            RegistryErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
            RegistryErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RegistryErrorKind::UnknownQueue(_) | RegistryErrorKind::Duplicate(_) => None,
            RegistryErrorKind::Codec(err) => Some(err),
            RegistryErrorKind::Transport(err) => Some(err),
        }
    }
}
