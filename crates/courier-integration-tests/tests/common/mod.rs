//! Common test utilities for courier integration tests
//!
//! This module provides:
//! - Tracing setup for test output
//! - Connection builders for every transport, backed by in-process backends
//! - A failure-injecting key-value store

use async_trait::async_trait;
use bytes::Bytes;
use courier::{
    BackendError, Connection, ConnectionConfig, KeyValueStore, LocalBroker, LocalStore,
    MemoryBroker, TransportKind,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
///
/// Honours `RUST_LOG`; defaults to warnings only.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Connections
// ============================================================================

fn fast_polling(transport: TransportKind) -> ConnectionConfig {
    ConnectionConfig {
        polling_interval_ms: 10,
        ..ConnectionConfig::for_transport(transport)
    }
}

#[allow(dead_code)]
pub fn memory_connection(broker: &MemoryBroker) -> Connection {
    Connection::with_memory_broker(broker.clone())
}

#[allow(dead_code)]
pub fn amqp_connection(broker: &LocalBroker) -> Connection {
    Connection::builder(fast_polling(TransportKind::Amqp))
        .amqp_broker(Arc::new(broker.clone()))
        .build()
        .expect("amqp connection should build")
}

#[allow(dead_code)]
pub fn key_value_connection(store: Arc<dyn KeyValueStore>) -> Connection {
    key_value_connection_with(store, fast_polling(TransportKind::KeyValue))
}

#[allow(dead_code)]
pub fn key_value_connection_with(
    store: Arc<dyn KeyValueStore>,
    config: ConnectionConfig,
) -> Connection {
    Connection::builder(config)
        .key_value_store(store)
        .build()
        .expect("key-value connection should build")
}

/// One fresh connection per transport, labelled for assertion messages
#[allow(dead_code)]
pub fn every_transport() -> Vec<(&'static str, Connection)> {
    vec![
        ("memory", memory_connection(&MemoryBroker::new())),
        ("amqp", amqp_connection(&LocalBroker::new())),
        (
            "key-value",
            key_value_connection(Arc::new(LocalStore::new())),
        ),
    ]
}

// ============================================================================
// Failure-injecting key-value store
// ============================================================================

/// Key-value store that fails a configurable number of upcoming operations
/// with a lost connection, then delegates to a [`LocalStore`]
#[derive(Clone)]
#[allow(dead_code)]
pub struct FlakyStore {
    inner: LocalStore,
    failures_left: Arc<AtomicU32>,
    failures_seen: Arc<AtomicU32>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(inner: LocalStore) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicU32::new(0)),
            failures_seen: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail the next `count` operations, including connects
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn failures_seen(&self) -> u32 {
        self.failures_seen.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BackendError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            self.failures_seen.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::ConnectionLost("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), BackendError> {
        self.check()?;
        self.inner.connect(config).await
    }

    async fn lpush(&self, key: &str, value: Bytes) -> Result<usize, BackendError> {
        self.check()?;
        self.inner.lpush(key, value).await
    }

    async fn rpush(&self, key: &str, value: Bytes) -> Result<usize, BackendError> {
        self.check()?;
        self.inner.rpush(key, value).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.check()?;
        self.inner.rpop(key).await
    }

    async fn llen(&self, key: &str) -> Result<usize, BackendError> {
        self.check()?;
        self.inner.llen(key).await
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.del(key).await
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), BackendError> {
        self.check()?;
        self.inner.hset(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, BackendError> {
        self.check()?;
        self.inner.hget(key, field).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, BackendError> {
        self.check()?;
        self.inner.hgetall(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.check()?;
        self.inner.smembers(key).await
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        self.inner.disconnect().await
    }
}
