//! Broker connection management.
//!
//! A [`ConnectionManager`] owns one logical connection for one [`Role`]. The
//! first [`connect`](ConnectionManager::connect) is the only call that can
//! fail in front of a caller; after that a background task waits for the
//! broker to close the connection, cools down, and reconnects with
//! exponential backoff for as long as the process lives.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable as _};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::transport::{DeliveryStream, Publish, Receiver, Sender, TransportError};

/// Which side of the broker a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, dsn: &str, role: Role) -> Result<Self::Connection, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Resolves once the broker has closed the connection.
    async fn closed(&self);

    async fn publish(&self, request: Publish) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TransportError>;
}

/// Timing of the automatic reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Fixed pause after the broker closed the connection.
    pub cool_down: Duration,
    /// Lower bound of the backoff interval.
    pub min_interval: Duration,
    /// Upper bound of a single backoff interval. Total elapsed time is unbounded.
    pub max_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(5),
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_interval)
            .with_max_delay(self.max_interval)
            .with_jitter()
            .without_max_times()
    }
}

/// Owns the connection of one role and keeps it alive.
///
/// Cloning is cheap; all clones share the same connection.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Connector> {
    connector: C,
    dsn: String,
    role: Role,
    policy: ReconnectPolicy,
    current: watch::Sender<Option<Arc<C::Connection>>>,
    connecting: Mutex<()>,
    watching: AtomicBool,
    shutdown: CancellationToken,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, dsn: impl Into<String>, role: Role, policy: ReconnectPolicy) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                connector,
                dsn: dsn.into(),
                role,
                policy,
                current,
                connecting: Mutex::new(()),
                watching: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Connect if not already connected.
    ///
    /// Returns the current connection straight away when it is open. On the
    /// first successful connect a background task starts watching for
    /// broker-initiated closure; once it runs, reconnecting is its job and
    /// this call waits for it.
    #[tracing::instrument(skip(self), fields(role = %self.inner.role))]
    pub async fn connect(&self) -> Result<Arc<C::Connection>, TransportError> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let _guard = self.inner.connecting.lock().await;
        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        if self.inner.watching.load(Ordering::Acquire) {
            return Ok(self.connected().await);
        }

        let conn = Arc::new(
            self.inner
                .connector
                .connect(&self.inner.dsn, self.inner.role)
                .await?,
        );
        self.inner.current.send_replace(Some(Arc::clone(&conn)));
        self.inner.watching.store(true, Ordering::Release);
        tracing::info!("Connected to broker");

        let manager = self.clone();
        let watched = Arc::clone(&conn);
        tokio::spawn(async move { manager.watch(watched).await });

        Ok(conn)
    }

    /// The live connection, if any.
    pub fn current(&self) -> Option<Arc<C::Connection>> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }

    /// Wait until a connection is available.
    pub async fn connected(&self) -> Arc<C::Connection> {
        let mut rx = self.inner.current.subscribe();
        loop {
            if let Some(conn) = self.current() {
                return conn;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `inner`, which `self` keeps alive.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop the reconnect loop. The current connection is left to the backend.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn watch(self, mut conn: Arc<C::Connection>) {
        let role = self.inner.role;
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = conn.closed() => {}
            }

            tracing::warn!(%role, "Broker closed the connection, reconnecting");
            self.inner.current.send_replace(None);

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.inner.policy.cool_down) => {}
            }

            let reconnect = || async {
                self.inner
                    .connector
                    .connect(&self.inner.dsn, self.inner.role)
                    .await
            };
            let attempt = reconnect
                .retry(self.inner.policy.backoff())
                .sleep(tokio::time::sleep)
                .notify(|error: &TransportError, delay: Duration| {
                    tracing::warn!(
                        %role,
                        %error,
                        backoff_ms = %delay.as_millis(),
                        "Reconnect failed, retrying after backoff"
                    );
                });

            let reconnected = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                result = attempt => result,
            };

            match reconnected {
                Ok(fresh) => {
                    conn = Arc::new(fresh);
                    self.inner.current.send_replace(Some(Arc::clone(&conn)));
                    tracing::info!(%role, "Reconnected to broker");
                }
                Err(error) => {
                    // Only reachable if the backoff ever gives up.
                    tracing::error!(%role, %error, "Reconnect loop gave up, starting over");
                }
            }
        }
    }
}

#[async_trait]
impl<C: Connector> Sender for ConnectionManager<C> {
    type Error = TransportError;

    async fn send(&mut self, request: Publish) -> Result<(), Self::Error> {
        let conn = self.current().ok_or_else(TransportError::disconnected)?;
        conn.publish(request).await
    }
}

#[async_trait]
impl<C: Connector> Receiver for ConnectionManager<C> {
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TransportError> {
        let conn = self.current().ok_or_else(TransportError::disconnected)?;
        conn.consume(queue, prefetch).await
    }
}
