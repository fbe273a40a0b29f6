//! # Courier
//!
//! Transport-agnostic messaging client. Application code produces and
//! consumes messages through one interface while the backend may be an
//! AMQP-style broker, a key-value store emulating queues, or an in-process
//! memory broker.
//!
//! This library provides:
//! - Lazy connections with an explicit state machine and transparent reconnect
//! - Channels that cache declarations and re-bind after a reconnect
//! - Pluggable serializers (json, yaml, raw) and compressors (zlib, lz4)
//! - Explicit acknowledgement with redelivery on reject or channel close
//! - `SimpleQueue` (durable work queue) and `SimpleBuffer` (volatile broadcast)
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all messaging operations
//! - [`config`] - Connection configuration, URL and file/environment loading
//! - [`retry`] - Reconnect backoff policy
//! - [`codec`] - Serializer and compressor registry
//! - [`entity`] - Exchanges, queues, bindings and routing
//! - [`message`] - Received messages and their properties
//! - [`transport`] - The supported transports
//! - [`backend`] - Broker and key-value store collaborators
//! - [`connection`], [`channel`], [`producer`], [`consumer`], [`simple`]
//!
//! ## Example
//!
//! ```no_run
//! use courier::Connection;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), courier::MessagingError> {
//! let connection = Connection::memory();
//! let queue = connection.simple_queue("log_queue").await?;
//!
//! queue.put(&serde_json::json!({"level": "info", "text": "started"})).await?;
//!
//! let message = queue.get(true, Some(Duration::from_secs(1))).await?;
//! println!("{}", message.decode()?);
//! message.ack().await?;
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod backend;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod entity;
pub mod error;
pub mod message;
pub mod producer;
pub mod retry;
pub mod simple;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use backend::{AmqpBroker, AmqpSession, BrokerDelivery, KeyValueStore, LocalBroker, LocalStore};
pub use channel::Channel;
pub use codec::{CodecRegistry, Compressor, Serializer};
pub use config::{ConnectionConfig, Credentials, RetryConfig, TransportKind};
pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use consumer::Consumer;
pub use entity::{Binding, Entity, Exchange, ExchangeType, Queue};
pub use error::{
    AckError, BackendError, CodecError, ConfigurationError, DeclarationError, DecodeError,
    MessagingError, MessagingResult, PublishError, TransportError,
};
pub use message::{DeliveryState, DeliveryTag, Message, MessageProperties, RawDelivery};
pub use producer::{Producer, PutOptions};
pub use retry::RetryPolicy;
pub use simple::{FacadeState, SimpleBuffer, SimpleQueue};
pub use transport::{MemoryBroker, Transport};
