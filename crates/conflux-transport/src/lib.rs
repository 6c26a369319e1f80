// Message delivery contract plus an in-process bounded-queue implementation.
//
// The engine only requires FIFO delivery per queue and a single registered
// consumer; external brokers (AMQP, etc.) integrate by implementing
// `MessageSource` without touching engine code.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("queue already has a consumer: {0}")]
    AlreadySubscribed(String),
    #[error("queue closed: {0}")]
    QueueClosed(String),
}

/// Source of opaque JSON payloads. One consumer per queue.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn MessageStream>>;
}

/// Consumer side of one queue. `None` means the queue was closed.
#[async_trait]
pub trait MessageStream: Send {
    async fn recv(&mut self) -> Option<Bytes>;
}

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct QueueState {
    sender: mpsc::Sender<Bytes>,
    // Held until the single consumer subscribes.
    receiver: Option<mpsc::Receiver<Bytes>>,
}

/// In-process named queues over bounded channels.
///
/// Queues are created lazily on first publish or subscribe. Publishing into
/// a full queue waits for capacity, which gives natural backpressure inside
/// a single process. Payloads published before the consumer attaches are
/// buffered up to the queue capacity.
pub struct InProcessQueue {
    capacity: usize,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, queue: &str) -> mpsc::Sender<Bytes> {
        let mut queues = self.queues.lock();
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(|| new_queue(self.capacity));
        state.sender.clone()
    }

    pub async fn publish(&self, queue: &str, payload: Bytes) -> Result<()> {
        // Clone the sender out of the lock; the send itself may suspend.
        let sender = self.sender(queue);
        sender
            .send(payload)
            .await
            .map_err(|_| TransportError::QueueClosed(queue.to_string()))
    }
}

fn new_queue(capacity: usize) -> QueueState {
    let (sender, receiver) = mpsc::channel(capacity);
    QueueState {
        sender,
        receiver: Some(receiver),
    }
}

#[async_trait]
impl MessageSource for InProcessQueue {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn MessageStream>> {
        let mut queues = self.queues.lock();
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(|| new_queue(self.capacity));
        let receiver = state
            .receiver
            .take()
            .ok_or_else(|| TransportError::AlreadySubscribed(queue.to_string()))?;
        Ok(Box::new(InProcessStream { receiver }))
    }
}

struct InProcessStream {
    receiver: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl MessageStream for InProcessStream {
    async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}
