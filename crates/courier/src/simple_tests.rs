//! Tests for the simple queue and buffer facades.

use super::*;
use crate::transport::MemoryBroker;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ============================================================================
// SimpleQueue
// ============================================================================

#[tokio::test]
async fn test_queue_put_get_in_order() {
    let connection = Connection::memory();
    let queue = connection.simple_queue("log_queue").await.unwrap();
    assert_eq!(queue.state(), FacadeState::Open);

    for n in 0..3 {
        queue.put(&json!({"n": n})).await.unwrap();
    }
    assert_eq!(queue.size().await.unwrap(), 3);

    for n in 0..3 {
        let message = queue.get(true, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(message.decode().unwrap()["n"], n);
        message.ack().await.unwrap();
    }
    assert!(queue.get_nowait().await.unwrap_err().is_empty());
}

#[tokio::test]
async fn test_queue_clear() {
    let connection = Connection::memory();
    let queue = connection.simple_queue("jobs").await.unwrap();
    queue.put("a").await.unwrap();
    queue.put("b").await.unwrap();

    assert_eq!(queue.clear().await.unwrap(), 2);
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_queue_get_times_out() {
    let connection = Connection::memory();
    let queue = connection.simple_queue("jobs").await.unwrap();

    let err = queue
        .get(true, Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_queue_get_with_unbounded_timeout() {
    let connection = Connection::memory();
    let queue = connection.simple_queue("jobs").await.unwrap();
    queue.put("ready").await.unwrap();

    let message = queue.get(true, Some(Duration::MAX)).await.unwrap();
    assert_eq!(message.payload::<String>().unwrap(), "ready");
    message.ack().await.unwrap();

    let producer = connection.simple_queue("jobs").await.unwrap();
    let waiter = tokio::spawn(async move {
        let message = queue
            .get(true, Some(Duration::from_secs(u64::MAX)))
            .await?;
        message.payload::<String>()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    producer.put("late").await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), "late");
}

#[tokio::test]
async fn test_queue_survives_between_facades() {
    let connection = Connection::memory();
    let first = connection.simple_queue("jobs").await.unwrap();
    first.put("kept").await.unwrap();
    first.close().await.unwrap();

    let second = connection.simple_queue("jobs").await.unwrap();
    let message = second.get_nowait().await.unwrap();
    assert_eq!(message.payload::<String>().unwrap(), "kept");
}

#[tokio::test]
async fn test_closed_queue_rejects_operations() {
    let connection = Connection::memory();
    let queue = connection.simple_queue("jobs").await.unwrap();

    assert_ok!(queue.close().await);
    assert_ok!(queue.close().await);
    assert_eq!(queue.state(), FacadeState::Closed);
    assert!(queue.channel().is_closed());

    let err = queue.put("late").await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Closed { ref resource } if resource == "simple queue 'jobs'"
    ));
    assert!(matches!(
        queue.get_nowait().await,
        Err(MessagingError::Closed { .. })
    ));
    assert_err!(queue.size().await);
    assert_err!(queue.clear().await);
}

#[tokio::test]
async fn test_queue_needs_its_connection_alive() {
    let queue = Connection::memory().simple_queue("jobs").await.unwrap();

    let err = queue.put("orphaned").await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Closed { ref resource } if resource == "connection"
    ));
}

#[tokio::test]
async fn test_queue_on_borrowed_channel_declares_lazily() {
    let broker = MemoryBroker::new();
    let connection = Connection::with_memory_broker(broker.clone());
    let channel = connection.channel().await.unwrap();

    let queue = SimpleQueue::with_channel(channel.clone(), "jobs").unwrap();
    assert_eq!(queue.state(), FacadeState::Created);
    assert!(!broker.has_queue("jobs"));

    queue.put("x").await.unwrap();
    assert_eq!(queue.state(), FacadeState::Open);
    assert!(broker.has_queue("jobs"));

    queue.close().await.unwrap();
    assert!(!channel.is_closed());
    assert_eq!(channel.queue_depth("jobs").await.unwrap(), 1);
}

#[tokio::test]
async fn test_queue_with_custom_topology() {
    let connection = Connection::memory();
    let topology = Queue::new("audit").durable(false);
    let queue = SimpleQueue::open(&connection, topology).await.unwrap();

    queue.put("entry").await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 1);
    assert!(!queue.queue().durable);
}

// ============================================================================
// SimpleBuffer
// ============================================================================

#[tokio::test]
async fn test_buffer_drops_messages_before_subscribe() {
    let connection = Connection::memory();
    let buffer = connection.simple_buffer("events").await.unwrap();
    assert_eq!(buffer.consumer_queue().await, None);
    assert_eq!(buffer.size().await.unwrap(), 0);
    assert_eq!(buffer.clear().await.unwrap(), 0);

    buffer.put("lost").await.unwrap();
    buffer.subscribe().await.unwrap();
    buffer.put("seen").await.unwrap();

    let message = buffer.get_nowait().await.unwrap();
    assert_eq!(message.payload::<String>().unwrap(), "seen");
    assert!(buffer.get_nowait().await.unwrap_err().is_empty());
}

#[tokio::test]
async fn test_every_attached_buffer_gets_a_copy() {
    let connection = Connection::memory();
    let first = connection.simple_buffer("events").await.unwrap();
    let second = connection.simple_buffer("events").await.unwrap();
    first.subscribe().await.unwrap();
    second.subscribe().await.unwrap();

    let first_queue = first.consumer_queue().await.unwrap();
    let second_queue = second.consumer_queue().await.unwrap();
    assert!(first_queue.starts_with("events.buffer."));
    assert_ne!(first_queue, second_queue);

    first.put(&json!({"kind": "ping"})).await.unwrap();

    assert_eq!(first.size().await.unwrap(), 1);
    assert_eq!(second.size().await.unwrap(), 1);
    for buffer in [&first, &second] {
        let message = buffer.get(true, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(message.decode().unwrap()["kind"], "ping");
        message.ack().await.unwrap();
    }
}

#[tokio::test]
async fn test_subscribe_twice_keeps_the_consumer_queue() {
    let connection = Connection::memory();
    let buffer = connection.simple_buffer("events").await.unwrap();

    buffer.subscribe().await.unwrap();
    let queue = buffer.consumer_queue().await;
    buffer.subscribe().await.unwrap();
    assert_eq!(buffer.consumer_queue().await, queue);
}

#[tokio::test]
async fn test_buffer_close_on_owned_channel() {
    let broker = MemoryBroker::new();
    let connection = Connection::with_memory_broker(broker.clone());
    let buffer = connection.simple_buffer("events").await.unwrap();
    buffer.subscribe().await.unwrap();
    let queue = buffer.consumer_queue().await.unwrap();
    assert!(broker.has_queue(&queue));

    buffer.close().await.unwrap();
    assert!(buffer.channel().is_closed());
    assert!(!broker.has_queue(&queue));
    assert!(matches!(
        buffer.put("late").await,
        Err(MessagingError::Closed { ref resource }) if resource == "simple buffer 'events'"
    ));
}

#[tokio::test]
async fn test_buffer_close_on_borrowed_channel_deletes_consumer_queue() {
    let broker = MemoryBroker::new();
    let connection = Connection::with_memory_broker(broker.clone());
    let channel = connection.channel().await.unwrap();
    let buffer = SimpleBuffer::with_channel(channel.clone(), "events").unwrap();
    assert_eq!(buffer.state(), FacadeState::Created);

    buffer.subscribe().await.unwrap();
    assert_eq!(buffer.state(), FacadeState::Open);
    let queue = buffer.consumer_queue().await.unwrap();

    buffer.close().await.unwrap();
    assert!(!channel.is_closed());
    assert!(!broker.has_queue(&queue));
    assert_eq!(buffer.consumer_queue().await, None);
}

#[tokio::test]
async fn test_dropped_buffer_stops_collecting_broadcasts() {
    let broker = MemoryBroker::new();
    let connection = Connection::with_memory_broker(broker.clone());
    let publisher = connection.simple_buffer("events").await.unwrap();

    let mut consumer_queues = Vec::new();
    for _ in 0..3 {
        let buffer = connection.simple_buffer("events").await.unwrap();
        buffer.subscribe().await.unwrap();
        consumer_queues.push(buffer.consumer_queue().await.unwrap());
    }

    assert!(eventually(|| consumer_queues.iter().all(|q| !broker.has_queue(q))).await);
    for n in 0..100 {
        publisher.put(&n).await.unwrap();
    }
    for queue in &consumer_queues {
        assert_eq!(broker.queue_len(queue), 0);
    }
}
