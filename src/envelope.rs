use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message container moved through every queue.
///
/// `Envelope` bundles a job payload together with its delivery metadata.
///
/// ## Design
///
/// - `H` represents message metadata; on the wire this is always [`Headers`]
/// - `M` represents the payload, either a typed job or the encoded
///   [`RawPayload`](crate::transport::RawPayload)
///
/// Keeping headers and payload separated lets the delay router and the
/// dead-letter sink move a message around without decoding its payload.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use refresh_queue::{Envelope, Headers};
///
/// let envelope: Envelope<_, _> = (Headers::new("apps", false), 440u32).into();
/// assert_eq!(envelope.headers.attempt, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

impl<H, M> Envelope<H, M> {
    /// Replace the payload, keeping the headers untouched.
    pub fn map_message<N>(self, f: impl FnOnce(M) -> N) -> Envelope<H, N> {
        Envelope {
            headers: self.headers,
            message: f(self.message),
        }
    }
}

/// Delivery metadata carried by every [`Envelope`].
///
/// `original_queue` and `first_seen` are fixed at first publish and never
/// change across retries. `attempt` is only ever advanced by the delay
/// router, one step per trip back to the original queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Queue the message logically belongs to.
    pub original_queue: String,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    /// When the message was first published.
    pub first_seen: DateTime<Utc>,
    /// Bypass freshness checks downstream.
    pub force: bool,
    /// Most recent queue the message sat in.
    pub last_queue: String,
    /// Earliest time the delay router may send the message back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
}

impl Headers {
    /// Headers for a message published for the first time.
    pub fn new(queue: impl Into<String>, force: bool) -> Self {
        let queue = queue.into();
        Self {
            original_queue: queue.clone(),
            attempt: 1,
            first_seen: Utc::now(),
            force,
            last_queue: queue,
            delay_until: None,
        }
    }

    /// Record that the message is now sitting in `queue`.
    ///
    /// Only sets `original_queue` when it is still empty.
    pub fn stamp(&mut self, queue: &str) {
        if self.original_queue.is_empty() {
            self.original_queue = queue.to_owned();
        }
        self.last_queue = queue.to_owned();
    }

    /// Headers for the next trip to the original queue.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            delay_until: None,
            ..self.clone()
        }
    }
}
