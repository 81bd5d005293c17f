use crate::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A named queue (point to point) or topic (broadcast to every receiver)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{}", name),
            Destination::Topic(name) => write!(f, "topic:{}", name),
        }
    }
}

/// Queue name with a substitutable node id, e.g. `md-mixdec-#nodeId#-req`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QueueTemplate(String);

impl QueueTemplate {
    pub const PLACEHOLDER: &'static str = "#nodeId#";

    pub fn new(pattern: impl Into<String>) -> Result<Self, ConfigError> {
        let pattern = pattern.into();
        if !pattern.contains(Self::PLACEHOLDER) {
            return Err(ConfigError::Invalid {
                name: "MIXING_DECRYPT_REQUEST_QUEUE_PATTERN",
                reason: format!("{:?} has no {} placeholder", pattern, Self::PLACEHOLDER),
            });
        }
        Ok(QueueTemplate(pattern))
    }

    /// Request queue of the given node
    pub fn resolve(&self, node_id: u32) -> Destination {
        Destination::Queue(self.0.replacen(Self::PLACEHOLDER, &node_id.to_string(), 1))
    }

    pub fn pattern(&self) -> &str {
        &self.0
    }
}

/// Handle of an attached receiver, used to detach it again
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiverId(pub u64);

/// Consumer of messages arriving on a destination.
///
/// Delivery is at-least-once: the same body may be handed over more than once.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, source: &Destination, body: Vec<u8>);
}

/// Send and receive primitives of the message queue transport
#[async_trait]
pub trait MessagingFabric: Send + Sync {
    async fn send(&self, destination: &Destination, body: Vec<u8>) -> Result<(), MessagingError>;

    async fn create_receiver(
        &self,
        destination: &Destination,
        listener: Arc<dyn MessageListener>,
    ) -> Result<ReceiverId, MessagingError>;

    async fn destroy_receiver(
        &self,
        destination: &Destination,
        receiver: ReceiverId,
    ) -> Result<(), MessagingError>;
}

type Receivers = HashMap<Destination, Vec<(ReceiverId, Arc<dyn MessageListener>)>>;

/// Messages kept per destination while it has no receiver; older ones are dropped
pub const MAX_PARKED_MESSAGES: usize = 1024;

/// In-process broker.
///
/// Every delivery runs on its own tokio task, so listeners observe the same
/// interleavings they would with a real broker. Messages sent to a destination
/// without receivers are parked, up to [`MAX_PARKED_MESSAGES`] each, and can be
/// inspected with [`InMemoryFabric::undelivered`]. Sent bodies are only kept by a
/// fabric built with [`InMemoryFabric::recording`].
#[derive(Default)]
pub struct InMemoryFabric {
    receivers: Mutex<Receivers>,
    undelivered: Mutex<HashMap<Destination, VecDeque<Vec<u8>>>>,
    sent: Mutex<Vec<(Destination, Vec<u8>)>>,
    record_sends: bool,
    send_count: AtomicUsize,
    next_receiver: AtomicU64,
    round_robin: AtomicUsize,
    fail_sends: AtomicBool,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fabric that also keeps every sent body, for inspection in tests
    pub fn recording() -> Self {
        InMemoryFabric {
            record_sends: true,
            ..Self::default()
        }
    }

    /// Make every following send fail with a transport error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Every body successfully sent to the destination, in send order.
    /// Always empty unless the fabric is recording.
    pub fn sent_to(&self, destination: &Destination) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Successful sends, counted whether or not the fabric is recording
    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Bodies parked on a destination that had no receiver at send time
    pub fn undelivered(&self, destination: &Destination) -> Vec<Vec<u8>> {
        self.undelivered
            .lock()
            .get(destination)
            .map(|parked| parked.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn receiver_count(&self, destination: &Destination) -> usize {
        self.receivers
            .lock()
            .get(destination)
            .map_or(0, |listeners| listeners.len())
    }
}

#[async_trait]
impl MessagingFabric for InMemoryFabric {
    async fn send(&self, destination: &Destination, body: Vec<u8>) -> Result<(), MessagingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MessagingError::Send {
                destination: destination.to_string(),
                reason: "broker unavailable".to_owned(),
            });
        }

        self.send_count.fetch_add(1, Ordering::SeqCst);
        if self.record_sends {
            self.sent.lock().push((destination.clone(), body.clone()));
        }

        let targets: Vec<Arc<dyn MessageListener>> = {
            let receivers = self.receivers.lock();
            match receivers.get(destination) {
                Some(listeners) if !listeners.is_empty() => match destination {
                    Destination::Topic(_) => listeners.iter().map(|(_, l)| l.clone()).collect(),
                    Destination::Queue(_) => {
                        let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
                        vec![listeners[next % listeners.len()].1.clone()]
                    }
                },
                _ => Vec::new(),
            }
        };

        if targets.is_empty() {
            trace!(%destination, "no receiver, parking message");
            let mut undelivered = self.undelivered.lock();
            let parked = undelivered.entry(destination.clone()).or_default();
            if parked.len() == MAX_PARKED_MESSAGES {
                warn!(%destination, "too many parked messages, dropping the oldest");
                parked.pop_front();
            }
            parked.push_back(body);
            return Ok(());
        }

        for listener in targets {
            let source = destination.clone();
            let body = body.clone();
            tokio::spawn(async move {
                listener.on_message(&source, body).await;
            });
        }
        Ok(())
    }

    async fn create_receiver(
        &self,
        destination: &Destination,
        listener: Arc<dyn MessageListener>,
    ) -> Result<ReceiverId, MessagingError> {
        let id = ReceiverId(self.next_receiver.fetch_add(1, Ordering::SeqCst));
        self.receivers
            .lock()
            .entry(destination.clone())
            .or_default()
            .push((id, listener));
        debug!(%destination, receiver = id.0, "receiver attached");
        Ok(id)
    }

    async fn destroy_receiver(
        &self,
        destination: &Destination,
        receiver: ReceiverId,
    ) -> Result<(), MessagingError> {
        let mut receivers = self.receivers.lock();
        let listeners = receivers
            .get_mut(destination)
            .ok_or_else(|| MessagingError::NoReceiver(destination.to_string()))?;
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != receiver);
        if listeners.len() == before {
            return Err(MessagingError::NoReceiver(destination.to_string()));
        }
        debug!(%destination, receiver = receiver.0, "receiver detached");
        Ok(())
    }
}
