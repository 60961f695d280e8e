use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tokio::sync::mpsc;

use crate::transport::{CallTransport, ReplyDelivery, RequestDelivery, WorkTransport};

/// Acquire a mutex guard, ignoring poisoning.
///
/// The protected state is a plain map or log with no cross-field
/// invariants; the worst outcome of a poisoned guard is a dropped
/// reply, which the broker model already allows.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory broker for testing or local pipelines.
///
/// Models the slice of broker behavior the bridge relies on: one shared
/// request queue with competing consumers, per-caller private reply
/// queues that disappear with their owner, and per-delivery
/// acknowledgement tags. Cloning the broker clones a handle to the same
/// shared state.
///
/// Acknowledged tags are recorded and exposed through
/// [`acked_tags`](InMemoryBroker::acked_tags) so tests can assert the
/// ack-exactly-once discipline.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    requests_tx: mpsc::UnboundedSender<QueuedRequest>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedRequest>>,
    reply_queues: Mutex<HashMap<String, mpsc::UnboundedSender<ReplyDelivery>>>,
    acked: Mutex<Vec<u64>>,
    next_tag: AtomicU64,
    next_queue: AtomicU64,
}

struct QueuedRequest {
    correlation_id: String,
    reply_to: String,
    payload: Vec<u8>,
}

impl Default for BrokerState {
    fn default() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            requests_tx,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            reply_queues: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(0),
            next_queue: AtomicU64::new(0),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client-side handle with its own private reply queue.
    ///
    /// The queue name is broker-assigned; the queue is removed when the
    /// handle is dropped, mirroring an exclusive auto-delete queue.
    pub fn caller(&self) -> InMemoryCaller {
        let (tx, rx) = mpsc::unbounded_channel();
        let reply_to = format!(
            "amq.gen-{}",
            self.state.next_queue.fetch_add(1, Ordering::Relaxed)
        );

        lock(&self.state.reply_queues).insert(reply_to.clone(), tx);

        InMemoryCaller {
            state: Arc::clone(&self.state),
            reply_to,
            reply_rx: rx,
        }
    }

    /// Create a worker-side handle competing for the shared request
    /// queue.
    pub fn worker(&self) -> InMemoryWorker {
        InMemoryWorker {
            state: Arc::clone(&self.state),
        }
    }

    /// Delivery tags acknowledged so far, in ack order.
    pub fn acked_tags(&self) -> Vec<u64> {
        lock(&self.state.acked).clone()
    }
}

/// Client-side handle of an [`InMemoryBroker`].
pub struct InMemoryCaller {
    state: Arc<BrokerState>,
    reply_to: String,
    reply_rx: mpsc::UnboundedReceiver<ReplyDelivery>,
}

impl InMemoryCaller {
    /// Broker-assigned name of this handle's reply queue.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }
}

impl Drop for InMemoryCaller {
    fn drop(&mut self) {
        lock(&self.state.reply_queues).remove(&self.reply_to);
    }
}

#[async_trait::async_trait]
impl CallTransport for InMemoryCaller {
    type Error = io::Error;

    async fn publish_request(
        &mut self,
        correlation_id: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error> {
        self.state
            .requests_tx
            .send(QueuedRequest {
                correlation_id: correlation_id.to_owned(),
                reply_to: self.reply_to.clone(),
                payload: payload.to_vec(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request queue closed"))
    }

    async fn next_reply(&mut self) -> Result<Option<ReplyDelivery>, Self::Error> {
        Ok(self.reply_rx.recv().await)
    }
}

/// Worker-side handle of an [`InMemoryBroker`].
pub struct InMemoryWorker {
    state: Arc<BrokerState>,
}

#[async_trait::async_trait]
impl WorkTransport for InMemoryWorker {
    type Error = io::Error;

    async fn next_request(&mut self) -> Result<Option<RequestDelivery>, Self::Error> {
        let mut rx = self.state.requests_rx.lock().await;
        let Some(queued) = rx.recv().await else {
            return Ok(None);
        };

        let delivery_tag = self.state.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Some(RequestDelivery {
            delivery_tag,
            correlation_id: Some(queued.correlation_id),
            reply_to: Some(queued.reply_to),
            payload: queued.payload,
        }))
    }

    async fn publish_reply(
        &mut self,
        reply_to: &str,
        correlation_id: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error> {
        // A reply addressed to a queue that no longer exists is dropped,
        // like a broker dropping mail to a deleted exclusive queue.
        if let Some(tx) = lock(&self.state.reply_queues).get(reply_to) {
            let _ = tx.send(ReplyDelivery {
                correlation_id: Some(correlation_id.to_owned()),
                payload: payload.to_vec(),
            });
        }

        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), Self::Error> {
        lock(&self.state.acked).push(delivery_tag);
        Ok(())
    }
}
