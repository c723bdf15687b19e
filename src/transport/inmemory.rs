use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, watch};

use crate::{
    connection::{Connection, Connector, Role},
    transport::{Acker, Delivery, DeliveryStream, Publish, TransportError, WireEnvelope},
};

/// In-memory broker for testing or local pipelines.
///
/// Queues live in shared memory and every clone of the broker sees the same
/// queues. It is useful for:
/// - Unit and integration testing
/// - Simulating broker-initiated connection closure
/// - Running a pipeline locally without RabbitMQ
///
/// Closing connections does not requeue unacknowledged deliveries; settling
/// them later still works.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<State>,
}

struct State {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    generation: AtomicU64,
    closed: watch::Sender<u64>,
    refuse: AtomicBool,
    opened: AtomicUsize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            queues: Mutex::default(),
            notify: Notify::new(),
            generation: AtomicU64::new(0),
            closed: watch::channel(0).0,
            refuse: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        }
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<WireEnvelope>,
    published: usize,
    acked: usize,
    nacked: usize,
}

impl InMemoryBroker {
    /// Messages currently waiting in `queue`.
    pub async fn queued(&self, queue: &str) -> Vec<WireEnvelope> {
        let queues = self.state.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of publishes `queue` has received.
    pub async fn published(&self, queue: &str) -> usize {
        self.counter(queue, |q| q.published).await
    }

    /// Number of deliveries from `queue` that were acknowledged.
    pub async fn acked(&self, queue: &str) -> usize {
        self.counter(queue, |q| q.acked).await
    }

    /// Number of deliveries from `queue` that were negatively acknowledged.
    pub async fn nacked(&self, queue: &str) -> usize {
        self.counter(queue, |q| q.nacked).await
    }

    /// Simulate the broker closing every open connection.
    pub fn close_connections(&self) {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.closed.send_replace(generation);
        self.state.notify.notify_waiters();
    }

    /// Make new connection attempts fail until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    async fn counter(&self, queue: &str, f: impl Fn(&QueueState) -> usize) -> usize {
        let queues = self.state.queues.lock().await;
        queues.get(queue).map(f).unwrap_or_default()
    }

    async fn push(&self, queue: &str, envelope: WireEnvelope) {
        let mut queues = self.state.queues.lock().await;
        let state = queues.entry(queue.to_owned()).or_default();
        state.ready.push_back(envelope);
        state.published += 1;
        drop(queues);
        self.state.notify.notify_waiters();
    }

    async fn pop(&self, queue: &str) -> Option<WireEnvelope> {
        let mut queues = self.state.queues.lock().await;
        queues.get_mut(queue).and_then(|q| q.ready.pop_front())
    }

    async fn settle(&self, queue: &str, settlement: Settlement) {
        let mut queues = self.state.queues.lock().await;
        let state = queues.entry(queue.to_owned()).or_default();
        match settlement {
            Settlement::Ack => state.acked += 1,
            Settlement::Requeue(envelope) => {
                state.nacked += 1;
                state.ready.push_front(envelope);
            }
            Settlement::Drop => state.nacked += 1,
        }
        drop(queues);
        self.state.notify.notify_waiters();
    }
}

enum Settlement {
    Ack,
    Requeue(WireEnvelope),
    Drop,
}

#[async_trait]
impl Connector for InMemoryBroker {
    type Connection = InMemoryConnection;

    #[tracing::instrument(skip_all, fields(%role))]
    async fn connect(&self, _dsn: &str, role: Role) -> Result<Self::Connection, TransportError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::connection("connection refused".into()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            broker: self.clone(),
            generation: self.state.generation.load(Ordering::SeqCst),
        })
    }
}

/// A connection to an [`InMemoryBroker`].
///
/// The connection is open until the broker's next
/// [`close_connections`](InMemoryBroker::close_connections).
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    generation: u64,
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.state.generation.load(Ordering::SeqCst) == self.generation
    }

    async fn closed(&self) {
        let mut rx = self.broker.state.closed.subscribe();
        let generation = self.generation;
        // Only errors if the broker state is dropped, which `self` prevents.
        let _ = rx.wait_for(|current| *current != generation).await;
    }

    #[tracing::instrument(skip_all, fields(queue = %request.queue))]
    async fn publish(&self, request: Publish) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::disconnected());
        }
        tracing::debug!(headers = ?request.envelope.headers, "Message sent to in-memory queue");
        self.broker.push(&request.queue, request.envelope).await;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TransportError> {
        if !self.is_open() {
            return Err(TransportError::disconnected());
        }

        let broker = self.broker.clone();
        let conn = InMemoryConnection {
            broker: self.broker.clone(),
            generation: self.generation,
        };
        let queue = queue.to_owned();
        let window = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));

        let deliveries = stream! {
            loop {
                let permit = tokio::select! {
                    permit = Arc::clone(&window).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = conn.closed() => break,
                };

                let envelope = loop {
                    let notified = broker.state.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if !conn.is_open() {
                        break None;
                    }
                    if let Some(envelope) = broker.pop(&queue).await {
                        break Some(envelope);
                    }
                    notified.await;
                };

                let Some(envelope) = envelope else { break };
                let acker = MemoryAcker {
                    broker: broker.clone(),
                    queue: queue.clone(),
                    envelope: envelope.clone(),
                    permit: std::sync::Mutex::new(Some(permit)),
                };
                yield Ok(Delivery::new(queue.clone(), envelope, acker));
            }
        };

        Ok(Box::pin(deliveries))
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    envelope: WireEnvelope,
    permit: std::sync::Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    // Settling twice is a broker-level protocol error, same as AMQP.
    fn release(&self) -> Result<(), TransportError> {
        let mut permit = self
            .permit
            .lock()
            .map_err(|_| TransportError::sender("acker lock poisoned".into()))?;
        match permit.take() {
            Some(_) => Ok(()),
            None => Err(TransportError::sender(
                "delivery already acknowledged".into(),
            )),
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.release()?;
        self.broker.settle(&self.queue, Settlement::Ack).await;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.release()?;
        let settlement = if requeue {
            Settlement::Requeue(self.envelope.clone())
        } else {
            Settlement::Drop
        };
        self.broker.settle(&self.queue, settlement).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{Envelope, Headers, transport::RawPayload};

    fn publish(queue: &str, n: u8) -> Publish {
        Publish {
            queue: queue.to_owned(),
            envelope: Envelope {
                headers: Headers::new(queue, false),
                message: vec![n].into(),
            },
        }
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect("memory://", Role::Consumer).await.unwrap();
        for n in 0..3 {
            conn.publish(publish("apps", n)).await.unwrap();
        }

        let mut stream = conn.consume("apps", 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "third delivery exceeded prefetch");

        first.ack().await.unwrap();
        let third = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third.envelope.message, RawPayload::from(vec![2u8]));
        assert_eq!(broker.acked("apps").await, 1);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect("memory://", Role::Consumer).await.unwrap();
        conn.publish(publish("apps", 7)).await.unwrap();

        let mut stream = conn.consume("apps", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.nack(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.envelope.message, RawPayload::from(vec![7u8]));
        assert!(again.ack().await.is_ok());
        assert!(again.ack().await.is_err());
    }

    #[tokio::test]
    async fn stream_ends_when_connection_closes() {
        let broker = InMemoryBroker::default();
        let conn = broker.connect("memory://", Role::Consumer).await.unwrap();
        let mut stream = conn.consume("apps", 1).await.unwrap();

        broker.close_connections();

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(conn.publish(publish("apps", 1)).await.is_err());
    }
}
