//! Backend collaborators consumed by the transports.
//!
//! The AMQP-like and key-value transports do not speak a wire protocol
//! themselves. They drive one of the traits below, which a protocol client
//! implements. In-process reference implementations ([`LocalBroker`],
//! [`LocalStore`]) follow the same semantics and back the test suites.

use crate::config::ConnectionConfig;
use crate::entity::{Binding, Exchange, Queue};
use crate::error::BackendError;
use crate::message::MessageProperties;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod local_broker;
pub mod local_store;

pub use local_broker::LocalBroker;
pub use local_store::LocalStore;

/// Entry point of an AMQP-style broker client
#[async_trait]
pub trait AmqpBroker: Send + Sync {
    /// Open one authenticated session to the broker
    async fn connect(&self, config: &ConnectionConfig)
        -> Result<Arc<dyn AmqpSession>, BackendError>;
}

/// Delivery returned by `basic_get`
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// Broker primitives available on an open AMQP session
#[async_trait]
pub trait AmqpSession: Send + Sync {
    /// Open a channel and return its broker-assigned number
    async fn open_channel(&self) -> Result<u64, BackendError>;

    /// Close a channel; its unacknowledged deliveries are requeued
    async fn close_channel(&self, channel: u64) -> Result<(), BackendError>;

    async fn exchange_declare(&self, channel: u64, exchange: &Exchange)
        -> Result<(), BackendError>;

    async fn queue_declare(&self, channel: u64, queue: &Queue) -> Result<(), BackendError>;

    async fn queue_bind(&self, channel: u64, binding: &Binding) -> Result<(), BackendError>;

    async fn basic_publish(
        &self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), BackendError>;

    /// Fetch the next message without waiting
    async fn basic_get(&self, channel: u64, queue: &str)
        -> Result<Option<BrokerDelivery>, BackendError>;

    async fn basic_ack(&self, channel: u64, delivery_tag: u64) -> Result<(), BackendError>;

    async fn basic_reject(
        &self,
        channel: u64,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BackendError>;

    /// Remove all ready messages, returning how many were removed
    async fn queue_purge(&self, channel: u64, queue: &str) -> Result<usize, BackendError>;

    async fn queue_delete(&self, channel: u64, queue: &str) -> Result<(), BackendError>;

    /// Ready message count, `None` if the broker does not report it
    async fn message_count(&self, channel: u64, queue: &str)
        -> Result<Option<usize>, BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

/// Key-value store client (Redis-like command set)
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Establish (or verify) the connection and authenticate
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), BackendError>;

    /// Push to the head of a list, returning the new length
    async fn lpush(&self, key: &str, value: Bytes) -> Result<usize, BackendError>;

    /// Push to the tail of a list, returning the new length
    async fn rpush(&self, key: &str, value: Bytes) -> Result<usize, BackendError>;

    /// Pop from the tail of a list
    async fn rpop(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    async fn llen(&self, key: &str) -> Result<usize, BackendError>;

    /// Delete a key, returning whether it existed
    async fn del(&self, key: &str) -> Result<bool, BackendError>;

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), BackendError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, BackendError>;

    /// Delete a hash field, returning whether it existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, BackendError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, BackendError>;

    /// Add a set member, returning whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackendError>;

    async fn disconnect(&self) -> Result<(), BackendError>;
}
