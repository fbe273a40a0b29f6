//! In-process broker with AMQP 0-9-1 routing and acknowledgement semantics.
//!
//! - Exchanges route by type (direct, fanout, topic); the nameless default
//!   exchange routes straight to the queue named by the routing key.
//! - Unroutable messages are dropped.
//! - Deliveries stay unacknowledged until acked or rejected; closing the
//!   owning channel or session requeues them at the head of their queue with
//!   the redelivered flag set.
//! - Redeclaring an entity with different flags fails with a precondition
//!   error.
//! - [`LocalBroker::drop_connections`] severs every open session, the way a
//!   broker restart would, and [`LocalBroker::set_available`] refuses new ones.

use super::{AmqpBroker, AmqpSession, BrokerDelivery};
use crate::config::ConnectionConfig;
use crate::entity::{Binding, Exchange, Queue};
use crate::error::BackendError;
use crate::message::MessageProperties;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct BrokerQueue {
    definition: Queue,
    ready: VecDeque<StoredMessage>,
}

struct Unacked {
    session: u64,
    channel: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, BrokerQueue>,
    bindings: HashSet<Binding>,
    unacked: HashMap<u64, Unacked>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BackendError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let definition = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BackendError::NotFound(format!("exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| definition.kind.matches(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Return unacked deliveries matching `owned` to the head of their queues
    fn requeue_where<F: Fn(&Unacked) -> bool>(&mut self, owned: F) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| owned(u))
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so the oldest ends up at the head
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    users: Mutex<HashMap<String, String>>,
    available: AtomicBool,
    generation: AtomicU64,
    next_session: AtomicU64,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
}

/// Shared in-process broker; clones refer to the same broker
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    /// Broker accepting any credentials
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                users: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Restrict logins to the registered users
    pub fn with_user(self, userid: impl Into<String>, password: impl Into<String>) -> Self {
        self.inner.users.lock().insert(userid.into(), password.into());
        self
    }

    /// Refuse (or accept again) new sessions
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Sever every open session; their unacked deliveries are requeued
    pub fn drop_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().requeue_where(|_| true);
    }

    /// Ready messages in `queue`, for assertions
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Check whether `queue` currently exists
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    fn authenticate(&self, config: &ConnectionConfig) -> Result<(), BackendError> {
        let users = self.inner.users.lock();
        if users.is_empty() {
            return Ok(());
        }
        let userid = config.credentials.userid.as_deref().unwrap_or_default();
        let password = config.credentials.password.as_deref().unwrap_or_default();
        match users.get(userid) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(BackendError::AccessRefused(format!(
                "login refused for user '{}'",
                userid
            ))),
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AmqpBroker for LocalBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn AmqpSession>, BackendError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!(
                "{} refused the connection",
                config.display_address()
            )));
        }
        self.authenticate(config)?;

        Ok(Arc::new(LocalBrokerSession {
            broker: self.inner.clone(),
            id: self.inner.next_session.fetch_add(1, Ordering::SeqCst),
            generation: self.inner.generation.load(Ordering::SeqCst),
            channels: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalBrokerSession {
    broker: Arc<BrokerInner>,
    id: u64,
    generation: u64,
    channels: Mutex<HashSet<u64>>,
    closed: AtomicBool,
}

impl LocalBrokerSession {
    fn check(&self, channel: u64) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst)
            || self.broker.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(BackendError::ConnectionLost(
                "broker connection closed".to_string(),
            ));
        }
        if !self.channels.lock().contains(&channel) {
            return Err(BackendError::Other(format!("channel {} is not open", channel)));
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpSession for LocalBrokerSession {
    async fn open_channel(&self) -> Result<u64, BackendError> {
        if self.closed.load(Ordering::SeqCst)
            || self.broker.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(BackendError::ConnectionLost(
                "broker connection closed".to_string(),
            ));
        }
        let channel = self.broker.next_channel.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().insert(channel);
        Ok(channel)
    }

    async fn close_channel(&self, channel: u64) -> Result<(), BackendError> {
        self.channels.lock().remove(&channel);
        let session = self.id;
        self.broker
            .state
            .lock()
            .requeue_where(|u| u.session == session && u.channel == channel);
        Ok(())
    }

    async fn exchange_declare(
        &self,
        channel: u64,
        exchange: &Exchange,
    ) -> Result<(), BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BackendError::PreconditionFailed(
                format!("exchange '{}' exists with different arguments", exchange.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, channel: u64, queue: &Queue) -> Result<(), BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        match state.queues.get(&queue.name) {
            Some(existing)
                if existing.definition.durable != queue.durable
                    || existing.definition.auto_delete != queue.auto_delete =>
            {
                Err(BackendError::PreconditionFailed(format!(
                    "queue '{}' exists with different arguments",
                    queue.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    BrokerQueue {
                        definition: queue.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, channel: u64, binding: &Binding) -> Result<(), BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BackendError::NotFound(format!(
                "exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BackendError::NotFound(format!("queue '{}'", binding.queue)));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn basic_publish(
        &self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        let targets = state.route(exchange, routing_key)?;
        let message = StoredMessage {
            body,
            properties: properties.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(())
    }

    async fn basic_get(
        &self,
        channel: u64,
        queue: &str,
    ) -> Result<Option<BrokerDelivery>, BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        let message = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::NotFound(format!("queue '{}'", queue)))?
            .ready
            .pop_front();

        let Some(message) = message else {
            return Ok(None);
        };

        let delivery_tag = self.broker.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = BrokerDelivery {
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        state.unacked.insert(
            delivery_tag,
            Unacked {
                session: self.id,
                channel,
                queue: queue.to_string(),
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn basic_ack(&self, channel: u64, delivery_tag: u64) -> Result<(), BackendError> {
        self.check(channel)?;
        self.broker
            .state
            .lock()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BackendError::PreconditionFailed(format!(
                "unknown delivery tag {}",
                delivery_tag
            )))
    }

    async fn basic_reject(
        &self,
        channel: u64,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            BackendError::PreconditionFailed(format!("unknown delivery tag {}", delivery_tag))
        })?;
        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        Ok(())
    }

    async fn queue_purge(&self, channel: u64, queue: &str) -> Result<usize, BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::NotFound(format!("queue '{}'", queue)))?;
        let purged = queue.ready.len();
        queue.ready.clear();
        Ok(purged)
    }

    async fn queue_delete(&self, channel: u64, queue: &str) -> Result<(), BackendError> {
        self.check(channel)?;
        let mut state = self.broker.state.lock();
        state.queues.remove(queue);
        state.bindings.retain(|b| b.queue != queue);
        state.unacked.retain(|_, u| u.queue != queue);
        Ok(())
    }

    async fn message_count(
        &self,
        channel: u64,
        queue: &str,
    ) -> Result<Option<usize>, BackendError> {
        self.check(channel)?;
        let state = self.broker.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| Some(q.ready.len()))
            .ok_or_else(|| BackendError::NotFound(format!("queue '{}'", queue)))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.lock().clear();
        let session = self.id;
        self.broker
            .state
            .lock()
            .requeue_where(|u| u.session == session);
        Ok(())
    }
}

#[cfg(test)]
#[path = "local_broker_tests.rs"]
mod tests;
