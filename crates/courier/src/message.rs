//! Message envelope, delivery metadata and acknowledgement state.

use crate::channel::Channel;
use crate::codec::CodecRegistry;
use crate::error::{AckError, DecodeError, MessagingError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque, transport-assigned token identifying one delivery on one channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for DeliveryTag {
    fn from(tag: u64) -> Self {
        Self(tag.to_string())
    }
}

// ============================================================================
// Properties and raw deliveries
// ============================================================================

/// Metadata published alongside a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: String,
    pub content_encoding: String,
    /// Compressor content type, `None` when the body is uncompressed
    pub compression: Option<String>,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageProperties {
    /// Properties for a freshly encoded payload, with a new message id
    pub fn new(content_type: impl Into<String>, content_encoding: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            compression: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_compression(mut self, compression: Option<String>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// A delivery as handed back by a transport poll
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub body: Bytes,
    pub properties: MessageProperties,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

// ============================================================================
// Message
// ============================================================================

/// Settlement state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Acked,
    Rejected,
    Requeued,
}

impl DeliveryState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acked => "acknowledged",
            Self::Rejected => "rejected",
            Self::Requeued => "requeued",
        }
    }
}

/// A received message.
///
/// The payload and metadata never change after receipt. `ack`/`reject` only
/// move the delivery state, and each message can be settled exactly once: a
/// second `ack` or `reject` fails with [`AckError::AlreadyAcknowledged`].
///
/// The body is decoded lazily on first access and the outcome, success or
/// failure, is cached. A message whose body cannot be decoded can still be
/// acked or rejected.
pub struct Message {
    delivery: RawDelivery,
    state: Mutex<DeliveryState>,
    decoded: OnceLock<Result<Value, DecodeError>>,
    channel: Channel,
    codecs: Arc<CodecRegistry>,
}

impl Message {
    pub(crate) fn new(delivery: RawDelivery, channel: Channel, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            delivery,
            state: Mutex::new(DeliveryState::Pending),
            decoded: OnceLock::new(),
            channel,
            codecs,
        }
    }

    /// Raw (possibly compressed) body bytes
    pub fn body(&self) -> &Bytes {
        &self.delivery.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.delivery.properties
    }

    pub fn content_type(&self) -> &str {
        &self.delivery.properties.content_type
    }

    pub fn content_encoding(&self) -> &str {
        &self.delivery.properties.content_encoding
    }

    pub fn compression(&self) -> Option<&str> {
        self.delivery.properties.compression.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.delivery.properties.headers
    }

    pub fn message_id(&self) -> &str {
        &self.delivery.properties.message_id
    }

    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    /// Queue the message was consumed from
    pub fn queue(&self) -> &str {
        &self.delivery.queue
    }

    pub fn delivery_state(&self) -> DeliveryState {
        *self.state.lock()
    }

    /// Check whether the message was already acked, rejected or requeued
    pub fn is_acknowledged(&self) -> bool {
        self.delivery_state() != DeliveryState::Pending
    }

    /// Decoded body as a dynamic value, decoded once and cached
    pub fn decode(&self) -> Result<&Value, DecodeError> {
        self.decoded
            .get_or_init(|| {
                let result = self.codecs.decode(
                    &self.delivery.body,
                    &self.delivery.properties.content_type,
                    self.delivery.properties.compression.as_deref(),
                );
                if let Err(err) = &result {
                    tracing::warn!(
                        delivery_tag = %self.delivery.delivery_tag,
                        queue = %self.delivery.queue,
                        error = %err,
                        "Message payload could not be decoded"
                    );
                }
                result
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Decoded body converted to an application type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        let value = self.decode()?;
        serde_json::from_value(value.clone()).map_err(|e| {
            MessagingError::Decode(DecodeError::TypeMismatch {
                message: e.to_string(),
            })
        })
    }

    /// Acknowledge the delivery
    pub async fn ack(&self) -> Result<(), MessagingError> {
        self.settle(DeliveryState::Acked).await
    }

    /// Reject the delivery, returning it to the queue when `requeue` is set
    pub async fn reject(&self, requeue: bool) -> Result<(), MessagingError> {
        let target = if requeue {
            DeliveryState::Requeued
        } else {
            DeliveryState::Rejected
        };
        self.settle(target).await
    }

    /// Reject and requeue
    pub async fn requeue(&self) -> Result<(), MessagingError> {
        self.reject(true).await
    }

    async fn settle(&self, target: DeliveryState) -> Result<(), MessagingError> {
        let tag = &self.delivery.delivery_tag;
        {
            let mut state = self.state.lock();
            if *state != DeliveryState::Pending {
                return Err(AckError::AlreadyAcknowledged {
                    delivery_tag: tag.to_string(),
                    state: state.as_str().to_string(),
                }
                .into());
            }
            *state = target;
        }

        let result = match target {
            DeliveryState::Acked => self.channel.ack(tag).await,
            DeliveryState::Requeued => self.channel.reject(tag, true).await,
            _ => self.channel.reject(tag, false).await,
        };

        if let Err(err) = result {
            *self.state.lock() = DeliveryState::Pending;
            return Err(err.into());
        }

        tracing::debug!(
            delivery_tag = %tag,
            queue = %self.delivery.queue,
            state = target.as_str(),
            "Message settled"
        );
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("queue", &self.delivery.queue)
            .field("content_type", &self.delivery.properties.content_type)
            .field("compression", &self.delivery.properties.compression)
            .field("redelivered", &self.delivery.redelivered)
            .field("body_len", &self.delivery.body.len())
            .field("state", &self.delivery_state())
            .finish()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
