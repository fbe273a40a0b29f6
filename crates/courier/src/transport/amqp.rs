//! AMQP-style broker transport.
//!
//! Entities map one-to-one onto broker primitives and the broker tracks
//! unacknowledged deliveries itself, so this layer only translates calls and
//! errors. The broker has no push consumer here; a blocking poll repeats
//! `basic_get` at the configured polling interval.

use super::{poll_with_interval, ChannelId};
use crate::backend::{AmqpBroker, AmqpSession};
use crate::config::ConnectionConfig;
use crate::entity::Entity;
use crate::error::{BackendError, TransportError};
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Transport driving an [`AmqpBroker`]
#[derive(Clone)]
pub struct AmqpTransport {
    broker: Arc<dyn AmqpBroker>,
}

impl AmqpTransport {
    pub fn new(broker: Arc<dyn AmqpBroker>) -> Self {
        Self { broker }
    }

    pub async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<AmqpSessionHandle, TransportError> {
        let session = self
            .broker
            .connect(config)
            .await
            .map_err(BackendError::into_transport_error)?;
        Ok(AmqpSessionHandle {
            session,
            polling_interval: config.polling_interval(),
        })
    }
}

/// Open broker session
pub struct AmqpSessionHandle {
    session: Arc<dyn AmqpSession>,
    polling_interval: Duration,
}

fn broker_tag(tag: &DeliveryTag) -> Result<u64, TransportError> {
    tag.as_str()
        .parse()
        .map_err(|_| TransportError::UnknownDeliveryTag {
            delivery_tag: tag.to_string(),
        })
}

impl AmqpSessionHandle {
    pub async fn open_channel(&self) -> Result<ChannelId, TransportError> {
        self.session
            .open_channel()
            .await
            .map(ChannelId)
            .map_err(BackendError::into_transport_error)
    }

    pub async fn close_channel(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.session
            .close_channel(channel.0)
            .await
            .map_err(BackendError::into_transport_error)
    }

    pub async fn declare(&self, channel: ChannelId, entity: &Entity) -> Result<(), TransportError> {
        let result = match entity {
            Entity::Exchange(exchange) => self.session.exchange_declare(channel.0, exchange).await,
            Entity::Queue(queue) => self.session.queue_declare(channel.0, queue).await,
            Entity::Binding(binding) => self.session.queue_bind(channel.0, binding).await,
        };
        result.map_err(BackendError::into_transport_error)
    }

    pub async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        self.session
            .basic_publish(channel.0, exchange, routing_key, body, properties)
            .await
            .map_err(BackendError::into_transport_error)
    }

    async fn try_get(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<Option<RawDelivery>, TransportError> {
        let delivery = self
            .session
            .basic_get(channel.0, queue)
            .await
            .map_err(BackendError::into_transport_error)?;

        Ok(delivery.map(|d| RawDelivery {
            body: d.body,
            properties: d.properties,
            delivery_tag: DeliveryTag::from(d.delivery_tag),
            redelivered: d.redelivered,
            exchange: d.exchange,
            routing_key: d.routing_key,
            queue: queue.to_string(),
        }))
    }

    pub async fn poll(
        &self,
        channel: ChannelId,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<RawDelivery>, TransportError> {
        poll_with_interval(self.polling_interval, block, timeout, move || {
            self.try_get(channel, queue)
        })
        .await
    }

    pub async fn ack(&self, channel: ChannelId, tag: &DeliveryTag) -> Result<(), TransportError> {
        self.session
            .basic_ack(channel.0, broker_tag(tag)?)
            .await
            .map_err(BackendError::into_transport_error)
    }

    pub async fn reject(
        &self,
        channel: ChannelId,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.session
            .basic_reject(channel.0, broker_tag(tag)?, requeue)
            .await
            .map_err(BackendError::into_transport_error)
    }

    pub async fn queue_depth(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<usize, TransportError> {
        self.session
            .message_count(channel.0, queue)
            .await
            .map_err(BackendError::into_transport_error)?
            .ok_or(TransportError::NotSupported {
                capability: "queue depth",
            })
    }

    pub async fn purge(&self, channel: ChannelId, queue: &str) -> Result<usize, TransportError> {
        self.session
            .queue_purge(channel.0, queue)
            .await
            .map_err(BackendError::into_transport_error)
    }

    pub async fn delete_queue(
        &self,
        channel: ChannelId,
        queue: &str,
    ) -> Result<(), TransportError> {
        self.session
            .queue_delete(channel.0, queue)
            .await
            .map_err(BackendError::into_transport_error)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.session
            .close()
            .await
            .map_err(BackendError::into_transport_error)
    }
}

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;
