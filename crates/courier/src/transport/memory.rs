//! In-memory transport.
//!
//! All state lives in a [`MemoryBroker`] shared by every connection created
//! from the same transport, so producers and consumers on different
//! connections see the same queues. Nothing is persisted.
//!
//! Acknowledgement is a no-op. Each channel keeps a restore record per
//! delivery so that a rejected-with-requeue message, or any message still
//! unsettled when its channel closes, can be put back at the head of its
//! queue with the redelivered flag set.

use super::ChannelId;
use crate::config::ConnectionConfig;
use crate::entity::{Binding, Entity, Exchange, Queue};
use crate::error::TransportError;
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

// ============================================================================
// Broker storage
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct InMemoryQueue {
    definition: Queue,
    messages: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct QueueStorage {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, InMemoryQueue>,
    bindings: HashSet<Binding>,
}

impl QueueStorage {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let definition = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound {
                name: exchange.to_string(),
            })?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| {
                b.exchange == exchange && definition.kind.matches(&b.routing_key, routing_key)
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }
}

struct BrokerInner {
    storage: Mutex<QueueStorage>,
    arrivals: Notify,
    next_session: AtomicU64,
    next_tag: AtomicU64,
}

/// Shared in-process message store; clones refer to the same queues
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                storage: Mutex::new(QueueStorage::default()),
                arrivals: Notify::new(),
                next_session: AtomicU64::new(1),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Ready messages in `queue`, for assertions
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .storage
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Check whether `queue` currently exists
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.storage.lock().queues.contains_key(queue)
    }

    fn push_front(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(queue) = self.inner.storage.lock().queues.get_mut(queue) {
            queue.messages.push_front(message);
        }
        self.inner.arrivals.notify_waiters();
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Transport and session
// ============================================================================

/// Transport whose connections all share one [`MemoryBroker`]
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<MemorySession, TransportError> {
        let id = self.broker.inner.next_session.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, "Memory session opened");
        Ok(MemorySession {
            broker: self.broker.clone(),
            id,
            next_channel: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

struct Restore {
    seq: u64,
    queue: String,
    message: StoredMessage,
}

/// One connection to the memory broker
pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    next_channel: AtomicU64,
    channels: Mutex<HashMap<u64, HashMap<DeliveryTag, Restore>>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn check(&self, channel: ChannelId) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost {
                message: format!("memory session {} is closed", self.id),
            });
        }
        if !self.channels.lock().contains_key(&channel.0) {
            return Err(TransportError::ChannelNotOpen {
                channel_id: channel.0,
            });
        }
        Ok(())
    }

    pub async fn open_channel(&self) -> Result<ChannelId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost {
                message: format!("memory session {} is closed", self.id),
            });
        }
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().insert(id, HashMap::new());
        Ok(ChannelId(id))
    }

    pub async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        let restores = self.channels.lock().remove(&channel.0).unwrap_or_default();
        self.restore_all(restores);
        Ok(())
    }

    fn restore_all(&self, restores: HashMap<DeliveryTag, Restore>) {
        let mut restores: Vec<Restore> = restores.into_values().collect();
        // Newest first so the oldest ends up at the head
        restores.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
        for restore in restores {
            debug!(queue = %restore.queue, "Requeueing unsettled delivery");
            self.broker.push_front(&restore.queue, restore.message);
        }
    }

    pub async fn declare(&self, channel: ChannelId, entity: &Entity) -> Result<(), TransportError> {
        self.check(channel)?;
        let mut storage = self.broker.inner.storage.lock();
        match entity {
            Entity::Exchange(exchange) => match storage.exchanges.get(&exchange.name) {
                Some(existing) if existing != exchange => Err(TransportError::PreconditionFailed {
                    message: format!("exchange '{}' exists with different flags", exchange.name),
                }),
                Some(_) => Ok(()),
                None => {
                    storage.exchanges.insert(exchange.name.clone(), exchange.clone());
                    Ok(())
                }
            },
            Entity::Queue(queue) => match storage.queues.get(&queue.name) {
                Some(existing)
                    if existing.definition.durable != queue.durable
                        || existing.definition.auto_delete != queue.auto_delete =>
                {
                    Err(TransportError::PreconditionFailed {
                        message: format!("queue '{}' exists with different flags", queue.name),
                    })
                }
                Some(_) => Ok(()),
                None => {
                    storage.queues.insert(
                        queue.name.clone(),
                        InMemoryQueue {
                            definition: queue.clone(),
                            messages: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            },
            Entity::Binding(binding) => {
                if !storage.exchanges.contains_key(&binding.exchange) {
                    return Err(TransportError::NotFound {
                        name: binding.exchange.clone(),
                    });
                }
                if !storage.queues.contains_key(&binding.queue) {
                    return Err(TransportError::NotFound {
                        name: binding.queue.clone(),
                    });
                }
                storage.bindings.insert(binding.clone());
                Ok(())
            }
        }
    }

    pub async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        self.check(channel)?;
        {
            let mut storage = self.broker.inner.storage.lock();
            let targets = storage.route(exchange, routing_key)?;
            if targets.is_empty() {
                debug!(exchange, routing_key, "Dropping unroutable message");
                return Ok(());
            }

            let message = StoredMessage {
                body,
                properties: properties.clone(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            };
            for target in targets {
                if let Some(queue) = storage.queues.get_mut(&target) {
                    queue.messages.push_back(message.clone());
                }
            }
        }
        self.broker.inner.arrivals.notify_waiters();
        Ok(())
    }

    fn try_pop(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<Option<RawDelivery>, TransportError> {
        self.check(channel)?;
        let message = {
            let mut storage = self.broker.inner.storage.lock();
            let stored = storage
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::NotFound {
                    name: queue.to_string(),
                })?;
            stored.messages.pop_front()
        };
        let Some(message) = message else {
            return Ok(None);
        };

        let seq = self.broker.inner.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery_tag = DeliveryTag::from(seq);
        let delivery = RawDelivery {
            body: message.body.clone(),
            properties: message.properties.clone(),
            delivery_tag: delivery_tag.clone(),
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            queue: queue.to_string(),
        };

        match self.channels.lock().get_mut(&channel.0) {
            Some(restores) => {
                restores.insert(
                    delivery_tag,
                    Restore {
                        seq,
                        queue: queue.to_string(),
                        message,
                    },
                );
            }
            // Channel closed while popping; hand the message back
            None => {
                self.broker.push_front(queue, message);
                return Err(TransportError::ChannelNotOpen {
                    channel_id: channel.0,
                });
            }
        }
        Ok(Some(delivery))
    }

    pub async fn poll(
        &self,
        channel: ChannelId,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<RawDelivery>, TransportError> {
        let deadline = super::deadline_after(timeout);
        loop {
            let arrival = self.broker.inner.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(delivery) = self.try_pop(channel, queue)? {
                return Ok(Some(delivery));
            }
            if !block {
                return Ok(None);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                        return Err(TransportError::Timeout {
                            duration: timeout.unwrap_or_default(),
                        });
                    }
                }
                None => arrival.await,
            }
        }
    }

    pub async fn ack(&self, channel: ChannelId, tag: &DeliveryTag) -> Result<(), TransportError> {
        self.check(channel)?;
        if let Some(restores) = self.channels.lock().get_mut(&channel.0) {
            restores.remove(tag);
        }
        Ok(())
    }

    pub async fn reject(
        &self,
        channel: ChannelId,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.check(channel)?;
        let restore = self
            .channels
            .lock()
            .get_mut(&channel.0)
            .and_then(|restores| restores.remove(tag));

        match (restore, requeue) {
            (Some(restore), true) => {
                self.broker.push_front(&restore.queue, restore.message);
                Ok(())
            }
            (Some(_), false) => Ok(()),
            (None, true) => Err(TransportError::UnknownDeliveryTag {
                delivery_tag: tag.to_string(),
            }),
            (None, false) => Ok(()),
        }
    }

    pub async fn queue_depth(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<usize, TransportError> {
        self.check(channel)?;
        self.broker
            .inner
            .storage
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .ok_or_else(|| TransportError::NotFound {
                name: queue.to_string(),
            })
    }

    pub async fn purge(&self, channel: ChannelId, queue: &str) -> Result<usize, TransportError> {
        self.check(channel)?;
        let mut storage = self.broker.inner.storage.lock();
        let stored = storage
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound {
                name: queue.to_string(),
            })?;
        let purged = stored.messages.len();
        stored.messages.clear();
        Ok(purged)
    }

    pub async fn delete_queue(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<(), TransportError> {
        self.check(channel)?;
        {
            let mut storage = self.broker.inner.storage.lock();
            storage.queues.remove(queue);
            storage.bindings.retain(|b| b.queue != queue);
        }
        for restores in self.channels.lock().values_mut() {
            restores.retain(|_, r| r.queue != queue);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, r)| r).collect();
        for restores in channels {
            self.restore_all(restores);
        }
        self.broker.inner.arrivals.notify_waiters();
        debug!(session = self.id, "Memory session closed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
