//! Transport abstractions and broker backends.
//!
//! The publish path is built around Tower's `Service` abstraction so callers
//! can compose middleware (timeouts, rate limits, tracing) in front of the
//! broker, while the consume path is a plain stream of [`Delivery`] values.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service<Publish>`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by anything that can publish
//! - [`Receiver`]: Trait implemented by anything that can consume
//! - [`Delivery`] / [`Acker`]: One consumed message and its settlement handle
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::stream::BoxStream;
use tower::{Service, ServiceExt as _, util::BoxCloneSyncService};
use tracing_error::SpanTrace;

use crate::{Envelope, Headers};

pub use inmemory::{InMemoryBroker, InMemoryConnection};

/// A wire envelope: metadata headers and an encoded payload.
pub type WireEnvelope = Envelope<Headers, RawPayload>;

/// Type-erased publish service held by the registry.
pub type PublishService = BoxCloneSyncService<Publish, (), TransportError>;

/// Stream of deliveries returned by a [`Receiver`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Request to publish one envelope to a named queue.
#[derive(Debug, Clone)]
pub struct Publish {
    pub queue: String,
    pub envelope: WireEnvelope,
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a [`Sender`] such as a
/// [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Erase the service type so the transport can be shared by the registry.
    pub fn boxed(self) -> Transport<PublishService>
    where
        S: Service<Publish> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        Transport {
            service: BoxCloneSyncService::new(self),
        }
    }

    /// Publish an envelope to `queue`.
    ///
    /// This is a convenience method for users that do not need direct access
    /// to the `tower::Service` API.
    pub async fn send(&self, queue: &str, envelope: WireEnvelope) -> Result<(), TransportError>
    where
        S: Service<Publish> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let request = Publish {
            queue: queue.to_owned(),
            envelope,
        };
        self.service
            .clone()
            .oneshot(request)
            .await
            .map_err(|e| TransportError::from_boxed(e.into()))?;
        Ok(())
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_boxed(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_boxed(e.into()))?;
            Ok(())
        })
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the broker while publishing or settling.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
    /// Errors establishing or using a broker connection.
    Connection(tower::BoxError),
    /// No live connection is available for this role.
    Disconnected,
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::new(TransportErrorKind::Sender(err))
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::new(TransportErrorKind::Serde(err))
    }

    /// Create a connection-related transport error.
    pub fn connection(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::new(TransportErrorKind::Connection(err))
    }

    /// No connection is currently available.
    pub fn disconnected() -> Self {
        Self::new(TransportErrorKind::Disconnected)
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    // Middleware may hand back an already-built `TransportError`; keep its kind.
    pub(crate) fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::sender(err),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            TransportErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
            TransportErrorKind::Disconnected => writeln!(f, "Not connected to the broker"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Connection(err) => Some(err.as_ref()),
            TransportErrorKind::Disconnected => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Publish> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Publish) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by anything that can publish to the broker.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish one envelope to the queue named in the request.
    async fn send(&mut self, request: Publish) -> Result<(), Self::Error>;
}

/// Trait implemented by anything that can consume from the broker.
#[async_trait::async_trait]
pub trait Receiver: Send + Sync {
    /// Start consuming `queue`, holding at most `prefetch` unacknowledged
    /// deliveries. The stream ends when the underlying connection closes.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TransportError>;
}

/// Settlement handle for one delivery.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// One message handed out by a [`Receiver`].
///
/// Nothing acknowledges a delivery implicitly: whoever ends up owning it must
/// call [`ack`](Delivery::ack) or [`nack`](Delivery::nack).
#[derive(Clone)]
pub struct Delivery {
    /// Queue the delivery was consumed from.
    pub queue: String,
    pub envelope: WireEnvelope,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, envelope: WireEnvelope, acker: impl Acker) -> Self {
        Self {
            queue: queue.into(),
            envelope,
            acker: Arc::new(acker),
        }
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("headers", &self.envelope.headers)
            .finish_non_exhaustive()
    }
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPayload(pub(crate) Vec<u8>);

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for RawPayload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        self.0.to_bytes()
    }
}
