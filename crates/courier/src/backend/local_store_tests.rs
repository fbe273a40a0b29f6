//! Tests for the in-process key-value store.

use super::*;

fn config() -> ConnectionConfig {
    ConnectionConfig::for_transport(crate::config::TransportKind::KeyValue)
}

#[tokio::test]
async fn test_list_is_fifo_with_lpush_rpop() {
    let store = LocalStore::new();
    store.lpush("q", Bytes::from_static(b"1")).await.unwrap();
    store.lpush("q", Bytes::from_static(b"2")).await.unwrap();
    assert_eq!(store.lpush("q", Bytes::from_static(b"3")).await.unwrap(), 3);

    assert_eq!(store.rpop("q").await.unwrap().unwrap(), "1");
    assert_eq!(store.rpop("q").await.unwrap().unwrap(), "2");

    // rpush puts the value next in line for rpop
    store.rpush("q", Bytes::from_static(b"0")).await.unwrap();
    assert_eq!(store.rpop("q").await.unwrap().unwrap(), "0");
    assert_eq!(store.rpop("q").await.unwrap().unwrap(), "3");
    assert!(store.rpop("q").await.unwrap().is_none());
    assert_eq!(store.llen("q").await.unwrap(), 0);
}

#[tokio::test]
async fn test_hash_operations() {
    let store = LocalStore::new();
    store.hset("h", "a", Bytes::from_static(b"1")).await.unwrap();
    store.hset("h", "b", Bytes::from_static(b"2")).await.unwrap();

    assert_eq!(store.hget("h", "a").await.unwrap().unwrap(), "1");
    assert!(store.hget("h", "missing").await.unwrap().is_none());

    let mut all = store.hgetall("h").await.unwrap();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].0, "a");

    assert!(store.hdel("h", "a").await.unwrap());
    assert!(!store.hdel("h", "a").await.unwrap());
    assert!(!store.hdel("nope", "a").await.unwrap());
}

#[tokio::test]
async fn test_set_operations() {
    let store = LocalStore::new();
    assert!(store.sadd("s", "b").await.unwrap());
    assert!(store.sadd("s", "a").await.unwrap());
    assert!(!store.sadd("s", "a").await.unwrap());

    assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);
    assert!(store.srem("s", "a").await.unwrap());
    assert!(!store.srem("s", "a").await.unwrap());
}

#[tokio::test]
async fn test_del_removes_any_key_type() {
    let store = LocalStore::new();
    store.lpush("k", Bytes::from_static(b"x")).await.unwrap();
    assert!(store.del("k").await.unwrap());
    assert!(!store.del("k").await.unwrap());

    store.sadd("s", "m").await.unwrap();
    assert!(store.del("s").await.unwrap());
    assert!(store.smembers("s").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_store_refuses_connect_and_commands() {
    let store = LocalStore::new();
    store.connect(&config()).await.unwrap();
    assert_eq!(store.connect_count(), 1);

    store.set_available(false);
    assert!(matches!(
        store.connect(&config()).await,
        Err(BackendError::Unavailable(_))
    ));
    assert!(matches!(
        store.llen("q").await,
        Err(BackendError::ConnectionLost(_))
    ));

    store.set_available(true);
    store.connect(&config()).await.unwrap();
    assert_eq!(store.connect_count(), 2);
}

#[tokio::test]
async fn test_password_protected_store() {
    let store = LocalStore::with_password("s3cret");

    assert!(matches!(
        store.connect(&config()).await,
        Err(BackendError::AccessRefused(_))
    ));

    let mut config = config();
    config.credentials.password = Some("s3cret".to_string());
    assert!(store.connect(&config).await.is_ok());
}

#[tokio::test]
async fn test_clones_share_data() {
    let store = LocalStore::new();
    let other = store.clone();
    store.lpush("q", Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(other.llen("q").await.unwrap(), 1);
}
