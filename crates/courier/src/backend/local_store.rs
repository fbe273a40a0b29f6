//! In-process key-value store with Redis list/hash/set semantics.
//!
//! Backs the key-value transport when no external store client is plugged
//! in. The store can be taken offline with [`LocalStore::set_available`] to
//! exercise reconnect handling: while offline, `connect` is refused and every
//! other command fails with a lost connection.

use super::KeyValueStore;
use crate::config::ConnectionConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct StoreData {
    lists: HashMap<String, VecDeque<Bytes>>,
    hashes: HashMap<String, HashMap<String, Bytes>>,
    sets: HashMap<String, BTreeSet<String>>,
}

struct StoreInner {
    data: Mutex<StoreData>,
    available: AtomicBool,
    password: Option<String>,
    connects: AtomicU64,
}

/// Shared in-process key-value store; clones refer to the same data
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Store accepting any credentials
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Store that only accepts connections presenting `password`
    pub fn with_password(password: impl Into<String>) -> Self {
        Self::build(Some(password.into()))
    }

    fn build(password: Option<String>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data: Mutex::new(StoreData::default()),
                available: AtomicBool::new(true),
                password,
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Take the store offline or bring it back
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `connect` calls so far
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::ConnectionLost(
                "key-value store went away".to_string(),
            ))
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), BackendError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!(
                "{} refused the connection",
                config.display_address()
            )));
        }

        if let Some(expected) = &self.inner.password {
            if config.credentials.password.as_deref() != Some(expected.as_str()) {
                return Err(BackendError::AccessRefused(
                    "invalid password".to_string(),
                ));
            }
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn lpush(&self, key: &str, value: Bytes) -> Result<usize, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        let list = data.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        Ok(list.len())
    }

    async fn rpush(&self, key: &str, value: Bytes) -> Result<usize, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        let list = data.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        Ok(list.len())
    }

    async fn rpop(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        Ok(data.lists.get_mut(key).and_then(|list| list.pop_back()))
    }

    async fn llen(&self, key: &str) -> Result<usize, BackendError> {
        self.check_online()?;
        let data = self.inner.data.lock();
        Ok(data.lists.get(key).map(|list| list.len()).unwrap_or(0))
    }

    async fn del(&self, key: &str) -> Result<bool, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        let removed = data.lists.remove(key).is_some()
            | data.hashes.remove(key).is_some()
            | data.sets.remove(key).is_some();
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, BackendError> {
        self.check_online()?;
        let data = self.inner.data.lock();
        Ok(data.hashes.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        Ok(data
            .hashes
            .get_mut(key)
            .map(|hash| hash.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, BackendError> {
        self.check_online()?;
        let data = self.inner.data.lock();
        Ok(data
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        Ok(data
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        self.check_online()?;
        let mut data = self.inner.data.lock();
        Ok(data
            .sets
            .get_mut(key)
            .map(|set| set.remove(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackendError> {
        self.check_online()?;
        let data = self.inner.data.lock();
        Ok(data
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "local_store_tests.rs"]
mod tests;
