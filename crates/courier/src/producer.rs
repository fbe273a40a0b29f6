//! Encoding and publishing.

use crate::channel::Channel;
use crate::codec::CodecRegistry;
use crate::error::{CodecError, MessagingError, MessagingResult, PublishError};
use crate::message::MessageProperties;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Per-publish overrides
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Serializer name; the connection default when `None`
    pub serializer: Option<String>,
    /// Compressor name or content type; the connection default when `None`
    pub compression: Option<String>,
    pub headers: HashMap<String, String>,
    pub correlation_id: Option<String>,
}

impl PutOptions {
    pub fn serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = Some(name.into());
        self
    }

    pub fn compression(mut self, name: impl Into<String>) -> Self {
        self.compression = Some(name.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Publishes encoded values to one exchange and routing key
#[derive(Debug, Clone)]
pub struct Producer {
    channel: Channel,
    exchange: String,
    routing_key: String,
    default_serializer: String,
    default_compression: Option<String>,
    codecs: Arc<CodecRegistry>,
}

impl Producer {
    /// Producer using the connection's codec registry and defaults
    pub fn new(
        channel: Channel,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> MessagingResult<Self> {
        let connection = channel.connection()?;
        let config = connection.config();
        Ok(Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            default_serializer: config.default_serializer.clone(),
            default_compression: config.default_compression.clone(),
            codecs: connection.codecs().clone(),
            channel,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn target(&self) -> &str {
        if self.exchange.is_empty() {
            &self.routing_key
        } else {
            &self.exchange
        }
    }

    fn encode_error(&self, source: CodecError) -> MessagingError {
        MessagingError::Publish {
            entity: self.target().to_string(),
            transport: self.channel.transport_kind(),
            source: PublishError::Encode(source),
        }
    }

    /// Publish `value` with the default serializer and compression,
    /// returning the message id
    pub async fn publish<T: Serialize + ?Sized>(&self, value: &T) -> MessagingResult<String> {
        self.publish_with(value, &PutOptions::default()).await
    }

    pub async fn publish_with<T: Serialize + ?Sized>(
        &self,
        value: &T,
        options: &PutOptions,
    ) -> MessagingResult<String> {
        let value = serde_json::to_value(value).map_err(|e| {
            self.encode_error(CodecError::Encode {
                codec: "serde".to_string(),
                reason: e.to_string(),
            })
        })?;
        self.publish_value(&value, options).await
    }

    /// Publish an already dynamic value
    pub async fn publish_value(
        &self,
        value: &Value,
        options: &PutOptions,
    ) -> MessagingResult<String> {
        let serializer = options
            .serializer
            .as_deref()
            .unwrap_or(&self.default_serializer);
        let compression = options
            .compression
            .as_deref()
            .or(self.default_compression.as_deref());

        let payload = self
            .codecs
            .encode(value, serializer, compression)
            .map_err(|e| self.encode_error(e))?;

        let properties = MessageProperties::new(payload.content_type, payload.content_encoding)
            .with_compression(payload.compression)
            .with_headers(options.headers.clone())
            .with_correlation_id(options.correlation_id.clone());
        let body_len = payload.body.len();

        self.channel
            .publish(&self.exchange, &self.routing_key, payload.body, &properties)
            .await?;

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            message_id = %properties.message_id,
            content_type = %properties.content_type,
            body_len,
            "Message published"
        );
        Ok(properties.message_id)
    }
}
