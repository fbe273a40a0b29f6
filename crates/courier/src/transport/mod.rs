//! Transport abstraction.
//!
//! [`Transport`] is a closed set of variants, one per supported backend. A
//! transport only knows how to make a single connection attempt; retry and
//! reconnect policy live in [`crate::Connection`]. A successful attempt yields
//! a [`Session`], which carries every channel-level primitive:
//!
//! | operation      | AMQP-like          | key-value            | memory           |
//! |----------------|--------------------|----------------------|------------------|
//! | declare        | broker declare     | hash/set metadata    | in-process table |
//! | publish        | `basic_publish`    | routed `lpush`       | routed push      |
//! | poll           | `basic_get` loop   | `rpop` loop          | notify wait      |
//! | ack            | `basic_ack`        | drop unacked record  | no-op            |
//! | reject+requeue | `basic_reject`     | push back at head    | push back at head|
//! | depth          | broker count       | `llen`               | exact            |

use crate::backend::{AmqpBroker, KeyValueStore};
use crate::config::{ConnectionConfig, TransportKind};
use crate::entity::Entity;
use crate::error::TransportError;
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub mod amqp;
pub mod key_value;
pub mod memory;

pub use amqp::{AmqpSessionHandle, AmqpTransport};
pub use key_value::{KeyValueSession, KeyValueTransport};
pub use memory::{MemoryBroker, MemorySession, MemoryTransport};

/// Transport-level channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The supported transports
#[derive(Clone)]
pub enum Transport {
    Amqp(AmqpTransport),
    KeyValue(KeyValueTransport),
    Memory(MemoryTransport),
}

impl Transport {
    /// AMQP-like transport driving `broker`
    pub fn amqp(broker: Arc<dyn AmqpBroker>) -> Self {
        Self::Amqp(AmqpTransport::new(broker))
    }

    /// Key-value transport emulating queues on `store`
    pub fn key_value(store: Arc<dyn KeyValueStore>) -> Self {
        Self::KeyValue(KeyValueTransport::new(store))
    }

    /// In-memory transport over `broker`
    pub fn memory(broker: MemoryBroker) -> Self {
        Self::Memory(MemoryTransport::new(broker))
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Amqp(_) => TransportKind::Amqp,
            Self::KeyValue(_) => TransportKind::KeyValue,
            Self::Memory(_) => TransportKind::Memory,
        }
    }

    /// Make a single connection attempt
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Session, TransportError> {
        match self {
            Self::Amqp(transport) => transport.connect(config).await.map(Session::Amqp),
            Self::KeyValue(transport) => transport.connect(config).await.map(Session::KeyValue),
            Self::Memory(transport) => transport.connect(config).await.map(Session::Memory),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transport").field(&self.kind()).finish()
    }
}

/// One live connection to a backend
pub enum Session {
    Amqp(AmqpSessionHandle),
    KeyValue(KeyValueSession),
    Memory(MemorySession),
}

impl Session {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Amqp(_) => TransportKind::Amqp,
            Self::KeyValue(_) => TransportKind::KeyValue,
            Self::Memory(_) => TransportKind::Memory,
        }
    }

    pub async fn open_channel(&self) -> Result<ChannelId, TransportError> {
        match self {
            Self::Amqp(session) => session.open_channel().await,
            Self::KeyValue(session) => session.open_channel().await,
            Self::Memory(session) => session.open_channel().await,
        }
    }

    /// Close a channel; deliveries it left unsettled return to their queues
    pub async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        match self {
            Self::Amqp(session) => session.close_channel(channel).await,
            Self::KeyValue(session) => session.close_channel(channel).await,
            Self::Memory(session) => session.close_channel(channel).await,
        }
    }

    pub async fn declare(&self, channel: ChannelId, entity: &Entity) -> Result<(), TransportError> {
        match self {
            Self::Amqp(session) => session.declare(channel, entity).await,
            Self::KeyValue(session) => session.declare(channel, entity).await,
            Self::Memory(session) => session.declare(channel, entity).await,
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
        match self {
            Self::Amqp(session) => {
                session
                    .publish(channel, exchange, routing_key, body, properties)
                    .await
            }
            Self::KeyValue(session) => {
                session
                    .publish(channel, exchange, routing_key, body, properties)
                    .await
            }
            Self::Memory(session) => {
                session
                    .publish(channel, exchange, routing_key, body, properties)
                    .await
            }
        }
    }

    /// Fetch the next delivery from `queue`.
    ///
    /// Non-blocking polls return `Ok(None)` when nothing is ready. Blocking
    /// polls wait until a delivery arrives, or fail with
    /// [`TransportError::Timeout`] once `timeout` elapses (`None` waits
    /// forever).
    pub async fn poll(
        &self,
        channel: ChannelId,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<RawDelivery>, TransportError> {
        match self {
            Self::Amqp(session) => session.poll(channel, queue, block, timeout).await,
            Self::KeyValue(session) => session.poll(channel, queue, block, timeout).await,
            Self::Memory(session) => session.poll(channel, queue, block, timeout).await,
        }
    }

    pub async fn ack(&self, channel: ChannelId, tag: &DeliveryTag) -> Result<(), TransportError> {
        match self {
            Self::Amqp(session) => session.ack(channel, tag).await,
            Self::KeyValue(session) => session.ack(channel, tag).await,
            Self::Memory(session) => session.ack(channel, tag).await,
        }
    }

    pub async fn reject(
        &self,
        channel: ChannelId,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), TransportError> {
        match self {
            Self::Amqp(session) => session.reject(channel, tag, requeue).await,
            Self::KeyValue(session) => session.reject(channel, tag, requeue).await,
            Self::Memory(session) => session.reject(channel, tag, requeue).await,
        }
    }

    /// Number of ready messages in `queue`
    pub async fn queue_depth(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<usize, TransportError> {
        match self {
            Self::Amqp(session) => session.queue_depth(channel, queue).await,
            Self::KeyValue(session) => session.queue_depth(channel, queue).await,
            Self::Memory(session) => session.queue_depth(channel, queue).await,
        }
    }

    /// Drop all ready messages, returning how many were removed
    pub async fn purge(&self, channel: ChannelId, queue: &str) -> Result<usize, TransportError> {
        match self {
            Self::Amqp(session) => session.purge(channel, queue).await,
            Self::KeyValue(session) => session.purge(channel, queue).await,
            Self::Memory(session) => session.purge(channel, queue).await,
        }
    }

    pub async fn delete_queue(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<(), TransportError> {
        match self {
            Self::Amqp(session) => session.delete_queue(channel, queue).await,
            Self::KeyValue(session) => session.delete_queue(channel, queue).await,
            Self::Memory(session) => session.delete_queue(channel, queue).await,
        }
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        match self {
            Self::Amqp(session) => session.close().await,
            Self::KeyValue(session) => session.close().await,
            Self::Memory(session) => session.close().await,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Session").field(&self.kind()).finish()
    }
}

/// Instant `timeout` from now; a timeout too large to represent never expires
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Repeatedly try `attempt` until it yields a delivery, sleeping `interval`
/// between tries, for backends that cannot push deliveries.
pub(crate) async fn poll_with_interval<F, Fut>(
    interval: Duration,
    block: bool,
    timeout: Option<Duration>,
    mut attempt: F,
) -> Result<Option<RawDelivery>, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<RawDelivery>, TransportError>>,
{
    let deadline = deadline_after(timeout);
    loop {
        if let Some(delivery) = attempt().await? {
            return Ok(Some(delivery));
        }
        if !block {
            return Ok(None);
        }

        let nap = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::Timeout {
                        duration: timeout.unwrap_or_default(),
                    });
                }
                interval.min(deadline - now)
            }
            None => interval,
        };
        tokio::time::sleep(nap).await;
    }
}
