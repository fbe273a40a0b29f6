//! Key-value store transport.
//!
//! Emulates exchanges and queues on top of a Redis-like [`KeyValueStore`]:
//!
//! - every queue is a list at `{namespace}{queue}`; publish `lpush`es a JSON
//!   envelope (body base64 encoded) and poll `rpop`s, giving FIFO order
//! - exchange definitions live in the `_courier.exchange` hash, queue
//!   definitions in `_courier.queue`
//! - bindings are members of the `_courier.binding.{exchange}` set, encoded as
//!   `{routing_key}\x06\x16{queue}`
//! - deliveries from durable queues are parked in the `_courier.unacked`
//!   hash until they are acked or rejected; entries older than the
//!   visibility timeout are pushed back when a session connects
//!
//! Popping a message and recording it as unacked are two separate commands.
//! A crash between them loses that one delivery.

use super::{poll_with_interval, ChannelId};
use crate::backend::KeyValueStore;
use crate::config::ConnectionConfig;
use crate::entity::{Binding, Entity, Exchange, Queue};
use crate::error::{BackendError, TransportError};
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const EXCHANGE_KEY: &str = "_courier.exchange";
const QUEUE_KEY: &str = "_courier.queue";
const BINDING_KEY_PREFIX: &str = "_courier.binding.";
const UNACKED_KEY: &str = "_courier.unacked";
const BINDING_SEPARATOR: &str = "\x06\x16";

// ============================================================================
// Stored formats
// ============================================================================

/// Custom serde module for Bytes as base64
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

/// Message as stored in a queue list
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(with = "bytes_serde")]
    body: Bytes,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    #[serde(default)]
    redelivered: bool,
}

/// Entry of the unacked hash
#[derive(Debug, Serialize, Deserialize)]
struct UnackedRecord {
    queue: String,
    delivered_at: DateTime<Utc>,
    envelope: Envelope,
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::Backend(BackendError::Other(e.to_string())))
}

fn from_json<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(data).map_err(|e| {
        TransportError::Backend(BackendError::Other(format!(
            "corrupt entry under '{}': {}",
            key, e
        )))
    })
}

fn binding_member(routing_key: &str, queue: &str) -> String {
    format!("{}{}{}", routing_key, BINDING_SEPARATOR, queue)
}

fn parse_binding_member(member: &str) -> Option<(&str, &str)> {
    member.split_once(BINDING_SEPARATOR)
}

// ============================================================================
// Transport
// ============================================================================

/// Transport emulating a broker on a key-value store
#[derive(Clone)]
pub struct KeyValueTransport {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueTransport {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<KeyValueSession, TransportError> {
        self.store
            .connect(config)
            .await
            .map_err(BackendError::into_transport_error)?;

        let session = KeyValueSession {
            store: self.store.clone(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            prefix: config.namespace_prefix(),
            polling_interval: config.polling_interval(),
            visibility_timeout: config.visibility_timeout(),
            seq: AtomicU64::new(1),
            next_channel: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        let restored = session.restore_visible().await?;
        if restored > 0 {
            warn!(
                restored,
                address = %config.display_address(),
                "Restored unacknowledged messages past their visibility timeout"
            );
        }
        Ok(session)
    }
}

/// Delivery handed out on a channel and not yet settled
struct Pending {
    seq: u64,
    queue: String,
    durable: bool,
    envelope: Envelope,
}

/// One connection to the key-value store
pub struct KeyValueSession {
    store: Arc<dyn KeyValueStore>,
    id: String,
    prefix: String,
    polling_interval: Duration,
    visibility_timeout: Duration,
    seq: AtomicU64,
    next_channel: AtomicU64,
    channels: Mutex<HashMap<u64, HashMap<DeliveryTag, Pending>>>,
    closed: AtomicBool,
}

impl KeyValueSession {
    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn binding_key(&self, exchange: &str) -> String {
        format!("{}{}{}", self.prefix, BINDING_KEY_PREFIX, exchange)
    }

    fn check(&self, channel: ChannelId) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost {
                message: format!("key-value session {} is closed", self.id),
            });
        }
        if !self.channels.lock().contains_key(&channel.0) {
            return Err(TransportError::ChannelNotOpen {
                channel_id: channel.0,
            });
        }
        Ok(())
    }

    async fn exchange_definition(&self, name: &str) -> Result<Option<Exchange>, TransportError> {
        let key = self.key(EXCHANGE_KEY);
        match self
            .store
            .hget(&key, name)
            .await
            .map_err(BackendError::into_transport_error)?
        {
            Some(data) => from_json(&key, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn queue_definition(&self, name: &str) -> Result<Option<Queue>, TransportError> {
        let key = self.key(QUEUE_KEY);
        match self
            .store
            .hget(&key, name)
            .await
            .map_err(BackendError::into_transport_error)?
        {
            Some(data) => from_json(&key, &data).map(Some),
            None => Ok(None),
        }
    }

    async fn require_queue(&self, name: &str) -> Result<Queue, TransportError> {
        self.queue_definition(name)
            .await?
            .ok_or_else(|| TransportError::NotFound {
                name: name.to_string(),
            })
    }

    /// Push parked deliveries older than the visibility timeout back onto
    /// their queues, returning how many were restored
    pub async fn restore_visible(&self) -> Result<usize, TransportError> {
        let key = self.key(UNACKED_KEY);
        let entries = self
            .store
            .hgetall(&key)
            .await
            .map_err(BackendError::into_transport_error)?;

        let visibility = chrono::Duration::from_std(self.visibility_timeout).ok();
        let now = Utc::now();
        let is_expired = |delivered_at: DateTime<Utc>| {
            visibility
                .and_then(|v| delivered_at.checked_add_signed(v))
                .map(|visible_at| visible_at <= now)
                .unwrap_or(false)
        };

        let mut expired: Vec<(String, UnackedRecord)> = Vec::new();
        for (tag, data) in entries {
            match from_json::<UnackedRecord>(&key, &data) {
                Ok(record) if is_expired(record.delivered_at) => {
                    expired.push((tag, record))
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(delivery_tag = %tag, error = %err, "Dropping corrupt unacked entry");
                    self.store
                        .hdel(&key, &tag)
                        .await
                        .map_err(BackendError::into_transport_error)?;
                }
            }
        }

        // Newest first so the oldest ends up at the consuming end
        expired.sort_by(|a, b| b.1.delivered_at.cmp(&a.1.delivered_at));

        let mut restored = 0;
        for (tag, record) in expired {
            if !self
                .store
                .hdel(&key, &tag)
                .await
                .map_err(BackendError::into_transport_error)?
            {
                // Another session restored or settled it first
                continue;
            }
            if self.queue_definition(&record.queue).await?.is_none() {
                continue;
            }
            let mut envelope = record.envelope;
            envelope.redelivered = true;
            self.store
                .rpush(&self.key(&record.queue), to_json(&envelope)?)
                .await
                .map_err(BackendError::into_transport_error)?;
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn open_channel(&self) -> Result<ChannelId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost {
                message: format!("key-value session {} is closed", self.id),
            });
        }
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().insert(id, HashMap::new());
        Ok(ChannelId(id))
    }

    pub async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        let pending = self.channels.lock().remove(&channel.0).unwrap_or_default();
        self.requeue_pending(pending).await
    }

    async fn requeue_pending(
        &self,
        pending: HashMap<DeliveryTag, Pending>,
    ) -> Result<(), TransportError> {
        let mut pending: Vec<(DeliveryTag, Pending)> = pending.into_iter().collect();
        pending.sort_unstable_by(|a, b| b.1.seq.cmp(&a.1.seq));

        let unacked_key = self.key(UNACKED_KEY);
        for (tag, mut pending) in pending {
            if pending.durable
                && !self
                    .store
                    .hdel(&unacked_key, tag.as_str())
                    .await
                    .map_err(BackendError::into_transport_error)?
            {
                // Already restored by another session
                continue;
            }
            pending.envelope.redelivered = true;
            self.store
                .rpush(&self.key(&pending.queue), to_json(&pending.envelope)?)
                .await
                .map_err(BackendError::into_transport_error)?;
            debug!(queue = %pending.queue, delivery_tag = %tag, "Requeued unsettled delivery");
        }
        Ok(())
    }

    pub async fn declare(&self, channel: ChannelId, entity: &Entity) -> Result<(), TransportError> {
        self.check(channel)?;
        match entity {
            Entity::Exchange(exchange) => {
                if let Some(existing) = self.exchange_definition(&exchange.name).await? {
                    if &existing != exchange {
                        return Err(TransportError::PreconditionFailed {
                            message: format!(
                                "exchange '{}' exists with different flags",
                                exchange.name
                            ),
                        });
                    }
                    return Ok(());
                }
                self.store
                    .hset(&self.key(EXCHANGE_KEY), &exchange.name, to_json(exchange)?)
                    .await
                    .map_err(BackendError::into_transport_error)
            }
            Entity::Queue(queue) => {
                if let Some(existing) = self.queue_definition(&queue.name).await? {
                    if existing.durable != queue.durable
                        || existing.auto_delete != queue.auto_delete
                    {
                        return Err(TransportError::PreconditionFailed {
                            message: format!("queue '{}' exists with different flags", queue.name),
                        });
                    }
                    return Ok(());
                }
                let definition = Queue {
                    exchange: None,
                    routing_key: String::new(),
                    ..queue.clone()
                };
                self.store
                    .hset(&self.key(QUEUE_KEY), &queue.name, to_json(&definition)?)
                    .await
                    .map_err(BackendError::into_transport_error)
            }
            Entity::Binding(binding) => self.bind(binding).await,
        }
    }

    async fn bind(&self, binding: &Binding) -> Result<(), TransportError> {
        if self.exchange_definition(&binding.exchange).await?.is_none() {
            return Err(TransportError::NotFound {
                name: binding.exchange.clone(),
            });
        }
        self.require_queue(&binding.queue).await?;
        self.store
            .sadd(
                &self.binding_key(&binding.exchange),
                &binding_member(&binding.routing_key, &binding.queue),
            )
            .await
            .map_err(BackendError::into_transport_error)?;
        Ok(())
    }

    async fn route(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(match self.queue_definition(routing_key).await? {
                Some(_) => vec![routing_key.to_string()],
                None => Vec::new(),
            });
        }

        let definition = self
            .exchange_definition(exchange)
            .await?
            .ok_or_else(|| TransportError::NotFound {
                name: exchange.to_string(),
            })?;
        let members = self
            .store
            .smembers(&self.binding_key(exchange))
            .await
            .map_err(BackendError::into_transport_error)?;

        let mut targets: Vec<String> = members
            .iter()
            .filter_map(|member| parse_binding_member(member))
            .filter(|(binding_key, _)| definition.kind.matches(binding_key, routing_key))
            .map(|(_, queue)| queue.to_string())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
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
        let targets = self.route(exchange, routing_key).await?;
        if targets.is_empty() {
            debug!(exchange, routing_key, "Dropping unroutable message");
            return Ok(());
        }

        let envelope = to_json(&Envelope {
            body,
            properties: properties.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        })?;
        for target in targets {
            self.store
                .lpush(&self.key(&target), envelope.clone())
                .await
                .map_err(BackendError::into_transport_error)?;
        }
        Ok(())
    }

    async fn try_pop(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<Option<RawDelivery>, TransportError> {
        self.check(channel)?;
        let definition = self.require_queue(queue).await?;
        let list_key = self.key(queue);

        let Some(data) = self
            .store
            .rpop(&list_key)
            .await
            .map_err(BackendError::into_transport_error)?
        else {
            return Ok(None);
        };
        let envelope: Envelope = from_json(&list_key, &data)?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let delivery_tag = DeliveryTag::new(format!("{}.{}", self.id, seq));

        if definition.durable {
            let record = UnackedRecord {
                queue: queue.to_string(),
                delivered_at: Utc::now(),
                envelope: envelope.clone(),
            };
            self.store
                .hset(&self.key(UNACKED_KEY), delivery_tag.as_str(), to_json(&record)?)
                .await
                .map_err(BackendError::into_transport_error)?;
        }

        let delivery = RawDelivery {
            body: envelope.body.clone(),
            properties: envelope.properties.clone(),
            delivery_tag: delivery_tag.clone(),
            redelivered: envelope.redelivered,
            exchange: envelope.exchange.clone(),
            routing_key: envelope.routing_key.clone(),
            queue: queue.to_string(),
        };

        if let Some(pending) = self.channels.lock().get_mut(&channel.0) {
            pending.insert(
                delivery_tag,
                Pending {
                    seq,
                    queue: queue.to_string(),
                    durable: definition.durable,
                    envelope,
                },
            );
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
        poll_with_interval(self.polling_interval, block, timeout, move || {
            self.try_pop(channel, queue)
        })
        .await
    }

    fn take_pending(&self, channel: ChannelId, tag: &DeliveryTag) -> Option<Pending> {
        self.channels
            .lock()
            .get_mut(&channel.0)
            .and_then(|pending| pending.remove(tag))
    }

    pub async fn ack(&self, channel: ChannelId, tag: &DeliveryTag) -> Result<(), TransportError> {
        self.check(channel)?;
        let pending = self.take_pending(channel, tag);
        if pending.map(|p| p.durable).unwrap_or(true) {
            self.store
                .hdel(&self.key(UNACKED_KEY), tag.as_str())
                .await
                .map_err(BackendError::into_transport_error)?;
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
        let unacked_key = self.key(UNACKED_KEY);

        let parked = match self.take_pending(channel, tag) {
            Some(pending) => {
                if pending.durable {
                    self.store
                        .hdel(&unacked_key, tag.as_str())
                        .await
                        .map_err(BackendError::into_transport_error)?;
                }
                Some((pending.queue, pending.envelope))
            }
            // Delivered before a reconnect; only the unacked hash knows it
            None => {
                let record = self
                    .store
                    .hget(&unacked_key, tag.as_str())
                    .await
                    .map_err(BackendError::into_transport_error)?;
                match record {
                    Some(data) => {
                        self.store
                            .hdel(&unacked_key, tag.as_str())
                            .await
                            .map_err(BackendError::into_transport_error)?;
                        let record: UnackedRecord = from_json(&unacked_key, &data)?;
                        Some((record.queue, record.envelope))
                    }
                    None => None,
                }
            }
        };

        if !requeue {
            return Ok(());
        }
        let Some((queue, mut envelope)) = parked else {
            return Err(TransportError::UnknownDeliveryTag {
                delivery_tag: tag.to_string(),
            });
        };

        envelope.redelivered = true;
        self.store
            .rpush(&self.key(&queue), to_json(&envelope)?)
            .await
            .map_err(BackendError::into_transport_error)?;
        Ok(())
    }

    pub async fn queue_depth(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<usize, TransportError> {
        self.check(channel)?;
        self.require_queue(queue).await?;
        self.store
            .llen(&self.key(queue))
            .await
            .map_err(BackendError::into_transport_error)
    }

    pub async fn purge(&self, channel: ChannelId, queue: &str) -> Result<usize, TransportError> {
        self.check(channel)?;
        self.require_queue(queue).await?;
        let list_key = self.key(queue);
        let purged = self
            .store
            .llen(&list_key)
            .await
            .map_err(BackendError::into_transport_error)?;
        self.store
            .del(&list_key)
            .await
            .map_err(BackendError::into_transport_error)?;
        Ok(purged)
    }

    pub async fn delete_queue(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<(), TransportError> {
        self.check(channel)?;
        let exchanges = self
            .store
            .hgetall(&self.key(EXCHANGE_KEY))
            .await
            .map_err(BackendError::into_transport_error)?;
        for (exchange, _) in exchanges {
            let set_key = self.binding_key(&exchange);
            let members = self
                .store
                .smembers(&set_key)
                .await
                .map_err(BackendError::into_transport_error)?;
            for member in members {
                if parse_binding_member(&member).map(|(_, q)| q == queue).unwrap_or(false) {
                    self.store
                        .srem(&set_key, &member)
                        .await
                        .map_err(BackendError::into_transport_error)?;
                }
            }
        }

        self.store
            .del(&self.key(queue))
            .await
            .map_err(BackendError::into_transport_error)?;
        self.store
            .hdel(&self.key(QUEUE_KEY), queue)
            .await
            .map_err(BackendError::into_transport_error)?;

        for pending in self.channels.lock().values_mut() {
            pending.retain(|_, p| p.queue != queue);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, p)| p).collect();
        for pending in channels {
            if let Err(err) = self.requeue_pending(pending).await {
                warn!(error = %err, "Could not requeue unsettled deliveries on close");
            }
        }
        self.store
            .disconnect()
            .await
            .map_err(BackendError::into_transport_error)?;
        info!(session = %self.id, "Key-value session closed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "key_value_tests.rs"]
mod tests;
