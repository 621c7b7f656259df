//! Message-broker boundary: publish to an exchange with a routing key,
//! consume a named queue with manual acknowledgement.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::{BrokerError, HandlerError};

pub const DISPATCH_EXCHANGE: &str = "dispatch";
pub const DRIVER_MATCHING_QUEUE: &str = "driver_matching";
pub const RIDE_STATUS_QUEUE: &str = "ride_status";

pub fn driver_response_key(ride_id: uuid::Uuid) -> String {
    format!("driver.response.{ride_id}")
}

pub fn driver_status_key(driver_id: uuid::Uuid) -> String {
    format!("driver.status.{driver_id}")
}

pub fn driver_matching_key(category: &str) -> String {
    format!("{DRIVER_MATCHING_QUEUE}.{category}")
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Outcome of a delivery attempt, as seen by the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Requeue,
    Reject,
}

impl From<&Result<(), HandlerError>> for Acknowledgement {
    fn from(result: &Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Acknowledgement::Ack,
            Err(HandlerError::Transient(_)) => Acknowledgement::Requeue,
            Err(HandlerError::Malformed(_)) => Acknowledgement::Reject,
        }
    }
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError>;
}

/// Serializes `message` as JSON and publishes it.
pub async fn publish_json<T: Serialize + Sync>(
    broker: &dyn MessageBroker,
    exchange: &str,
    routing_key: &str,
    message: &T,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_vec(message)?;
    broker.publish(exchange, routing_key, payload).await
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub rejected: AtomicU64,
}

impl DeliveryStats {
    fn record(&self, ack: Acknowledgement) {
        let counter = match ack {
            Acknowledgement::Ack => &self.acked,
            Acknowledgement::Requeue => &self.requeued,
            Acknowledgement::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Binding {
    queue: String,
    exchange: String,
    /// Exact key, or a `prefix.#` wildcard.
    pattern: String,
}

impl Binding {
    fn matches(&self, exchange: &str, routing_key: &str) -> bool {
        if self.exchange != exchange {
            return false;
        }
        match self.pattern.strip_suffix('#') {
            Some(prefix) => routing_key.starts_with(prefix),
            None => self.pattern == routing_key,
        }
    }
}

/// Single-process broker with at-least-once delivery semantics.
pub struct InMemoryBroker {
    queues: DashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    pending: DashMap<String, mpsc::UnboundedReceiver<Vec<u8>>>,
    bindings: RwLock<Vec<Binding>>,
    published_tx: broadcast::Sender<PublishedMessage>,
    stats: Arc<DeliveryStats>,
    requeue_delay: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (published_tx, _unused_rx) = broadcast::channel(1024);
        Self {
            queues: DashMap::new(),
            pending: DashMap::new(),
            bindings: RwLock::new(Vec::new()),
            published_tx,
            stats: Arc::new(DeliveryStats::default()),
            requeue_delay: Duration::from_millis(100),
        }
    }

    /// Routes messages matching `pattern` on `exchange` into `queue`.
    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) {
        self.ensure_queue(queue);
        self.bindings.write().push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
    }

    /// Every published message, whether or not a queue is bound to it.
    pub fn published(&self) -> broadcast::Receiver<PublishedMessage> {
        self.published_tx.subscribe()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    fn ensure_queue(&self, queue: &str) {
        if self.queues.contains_key(queue) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.entry(queue.to_string()).or_insert_with(|| {
            self.pending.insert(queue.to_string(), rx);
            tx
        });
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let targets: Vec<String> = self
            .bindings
            .read()
            .iter()
            .filter(|binding| binding.matches(exchange, routing_key))
            .map(|binding| binding.queue.clone())
            .collect();

        for queue in targets {
            if let Some(tx) = self.queues.get(&queue) {
                tx.send(payload.clone()).map_err(|_| BrokerError::Publish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: format!("queue {queue} closed"),
                })?;
            }
        }

        let _ = self.published_tx.send(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
        debug!(exchange, routing_key, "published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError> {
        self.ensure_queue(queue);
        let (_, mut rx) = self.pending.remove(queue).ok_or_else(|| BrokerError::Subscribe {
            queue: queue.to_string(),
            reason: "queue already has a consumer".to_string(),
        })?;
        let requeue_tx = self
            .queues
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::Subscribe {
                queue: queue.to_string(),
                reason: "queue missing".to_string(),
            })?;

        let stats = self.stats.clone();
        let requeue_delay = self.requeue_delay;
        let queue = queue.to_string();

        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let result = handler.handle(&payload).await;
                let ack = Acknowledgement::from(&result);
                stats.record(ack);

                match (ack, result) {
                    (Acknowledgement::Requeue, Err(err)) => {
                        warn!(queue = %queue, error = %err, "handler failed; requeueing delivery");
                        let requeue_tx = requeue_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(requeue_delay).await;
                            let _ = requeue_tx.send(payload);
                        });
                    }
                    (Acknowledgement::Reject, Err(err)) => {
                        warn!(queue = %queue, error = %err, "rejecting undeliverable message");
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }
}
