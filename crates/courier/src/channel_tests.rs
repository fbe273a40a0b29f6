//! Tests for channels: declaration cache, operations and re-binding.

use super::*;
use crate::backend::{AmqpBroker, AmqpSession, LocalBroker};
use crate::config::ConnectionConfig;
use crate::connection::ConnectionState;
use crate::entity::{Binding, Exchange, ExchangeType, Queue};
use crate::error::DeclarationError;
use crate::transport::MemoryBroker;

fn properties() -> MessageProperties {
    MessageProperties::new("text/plain", "utf-8")
}

fn amqp_connection(broker: &LocalBroker) -> Connection {
    let config = ConnectionConfig {
        polling_interval_ms: 10,
        ..ConnectionConfig::for_transport(TransportKind::Amqp)
    };
    Connection::builder(config)
        .amqp_broker(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

/// Wait briefly for background cleanup to satisfy `condition`
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
// Declarations
// ============================================================================

#[tokio::test]
async fn test_named_queue_declares_exchange_queue_and_binding() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();

    channel.declare(Queue::named("jobs")).await.unwrap();

    let declared = channel.declared();
    assert_eq!(declared.len(), 3);
    assert!(matches!(&declared[0], Entity::Exchange(e) if e.name == "jobs"));
    assert!(matches!(&declared[1], Entity::Queue(q) if q.name == "jobs"));
    assert_eq!(
        declared[2],
        Entity::Binding(Binding::new("jobs", "jobs", "jobs"))
    );
}

#[tokio::test]
async fn test_identical_redeclare_is_a_no_op() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();

    channel.declare(Queue::named("jobs")).await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();
    channel.declare(Exchange::new("jobs")).await.unwrap();

    assert_eq!(channel.declared().len(), 3);
}

#[tokio::test]
async fn test_conflicting_redeclare_fails_fast() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    channel.declare(Exchange::new("events")).await.unwrap();

    let err = channel
        .declare(Exchange::new("events").with_kind(ExchangeType::Topic))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Declaration {
            source: DeclarationError::Conflict { .. },
            ..
        }
    ));
    assert_eq!(channel.declared().len(), 1);
}

#[tokio::test]
async fn test_conflict_with_other_channel_comes_from_transport() {
    let connection = Connection::memory();
    let first = connection.channel().await.unwrap();
    let second = connection.channel().await.unwrap();
    first.declare(Queue::new("jobs")).await.unwrap();

    let err = second
        .declare(Queue::new("jobs").durable(false))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Declaration {
            source: DeclarationError::Transport(TransportError::PreconditionFailed { .. }),
            ..
        }
    ));
}

#[tokio::test]
async fn test_invalid_name_is_rejected() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();

    let err = channel.declare(Queue::new("")).await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Declaration {
            source: DeclarationError::InvalidName { .. },
            ..
        }
    ));
    assert!(channel.declared().is_empty());
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_publish_poll_and_depth() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();

    channel
        .publish("jobs", "jobs", Bytes::from_static(b"payload"), &properties())
        .await
        .unwrap();
    assert_eq!(channel.queue_depth("jobs").await.unwrap(), 1);

    let delivery = channel.poll("jobs", false, None).await.unwrap().unwrap();
    assert_eq!(delivery.body, "payload");
    channel.ack(&delivery.delivery_tag).await.unwrap();

    assert!(channel.poll("jobs", false, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_poll_timeout_maps_to_messaging_timeout() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();

    let err = channel
        .poll("jobs", true, Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Timeout { operation: "get", ref entity, .. } if entity == "jobs"
    ));
}

#[tokio::test]
async fn test_cancelled_poll_leaves_channel_usable() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(30), channel.poll("jobs", true, None)).await;
    assert!(cancelled.is_err());
    assert_eq!(channel.declared().len(), 3);

    channel
        .publish("jobs", "jobs", Bytes::from_static(b"after"), &properties())
        .await
        .unwrap();
    let delivery = channel.poll("jobs", false, None).await.unwrap().unwrap();
    assert_eq!(delivery.body, "after");
}

#[tokio::test]
async fn test_publish_to_unknown_exchange_is_a_publish_error() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();

    let err = channel
        .publish("missing", "rk", Bytes::new(), &properties())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Publish {
            ref entity,
            transport: TransportKind::Memory,
            source: PublishError::Transport(TransportError::NotFound { .. }),
        } if entity == "missing"
    ));
}

#[tokio::test]
async fn test_delete_queue_forgets_declaration() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();

    channel.delete_queue("jobs").await.unwrap();
    let declared = channel.declared();
    assert_eq!(declared.len(), 1);
    assert!(matches!(&declared[0], Entity::Exchange(_)));

    // Declaring again after deletion reaches the transport
    channel.declare(Queue::named("jobs")).await.unwrap();
    assert_eq!(channel.queue_depth("jobs").await.unwrap(), 0);
}

// ============================================================================
// Closing
// ============================================================================

#[tokio::test]
async fn test_closed_channel_rejects_operations() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();

    channel.close().await.unwrap();
    channel.close().await.unwrap();
    assert!(channel.is_closed());

    assert!(matches!(
        channel.queue_depth("jobs").await,
        Err(MessagingError::Closed { .. })
    ));
    assert!(matches!(
        channel.declare(Queue::new("other")).await,
        Err(MessagingError::Closed { .. })
    ));
    assert!(matches!(
        channel.ack(&DeliveryTag::new("1")).await,
        Err(MessagingError::Ack(AckError::ChannelClosed { .. }))
    ));

    // The connection stays usable
    assert_eq!(connection.state(), ConnectionState::Connected);
    let other = connection.channel().await.unwrap();
    assert_eq!(other.queue_depth("jobs").await.unwrap(), 0);
}

#[tokio::test]
async fn test_close_deletes_auto_delete_queues_and_requeues_unacked() {
    let broker = MemoryBroker::new();
    let connection = Connection::with_memory_broker(broker.clone());
    let channel = connection.channel().await.unwrap();
    channel
        .declare(Queue::new("scratch").durable(false).auto_delete(true))
        .await
        .unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();
    channel
        .publish("jobs", "jobs", Bytes::from_static(b"work"), &properties())
        .await
        .unwrap();
    channel.poll("jobs", false, None).await.unwrap().unwrap();
    assert_eq!(broker.queue_len("jobs"), 0);

    channel.close().await.unwrap();

    assert!(!broker.has_queue("scratch"));
    assert!(broker.has_queue("jobs"));
    assert_eq!(broker.queue_len("jobs"), 1);
}

#[tokio::test]
async fn test_dropping_last_handle_releases_channel() {
    let broker = MemoryBroker::new();
    let connection = Connection::with_memory_broker(broker.clone());
    let channel = connection.channel().await.unwrap();
    channel
        .declare(Queue::new("scratch").durable(false).auto_delete(true))
        .await
        .unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();
    channel
        .publish("jobs", "jobs", Bytes::from_static(b"work"), &properties())
        .await
        .unwrap();
    channel.poll("jobs", false, None).await.unwrap().unwrap();

    let other_handle = channel.clone();
    drop(channel);
    tokio::task::yield_now().await;
    assert!(broker.has_queue("scratch"));

    drop(other_handle);
    assert!(eventually(|| !broker.has_queue("scratch")).await);
    assert!(eventually(|| broker.queue_len("jobs") == 1).await);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_channel_outliving_connection() {
    let connection = Connection::memory();
    let channel = connection.channel().await.unwrap();
    drop(connection);

    assert!(matches!(
        channel.connection(),
        Err(MessagingError::Closed { .. })
    ));
    assert!(matches!(
        channel.queue_depth("jobs").await,
        Err(MessagingError::Closed { .. })
    ));
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_rebind_replays_declarations_after_reconnect() {
    let broker = LocalBroker::new();
    let connection = amqp_connection(&broker);
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();
    channel
        .publish("jobs", "jobs", Bytes::from_static(b"before"), &properties())
        .await
        .unwrap();

    // Someone else removes the queue, then the broker restarts
    let admin = broker.connect(connection.config()).await.unwrap();
    let admin_channel = admin.open_channel().await.unwrap();
    admin.queue_delete(admin_channel, "jobs").await.unwrap();
    assert!(!broker.has_queue("jobs"));
    broker.drop_connections();

    // The first use after the restart observes the lost session
    let err = channel.queue_depth("jobs").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(connection.state(), ConnectionState::Failed);

    // The next one reconnects, re-binds and replays the declarations
    assert_eq!(channel.queue_depth("jobs").await.unwrap(), 0);
    assert!(broker.has_queue("jobs"));
    assert_eq!(connection.epoch(), Some(2));

    channel
        .publish("jobs", "jobs", Bytes::from_static(b"after"), &properties())
        .await
        .unwrap();
    let delivery = channel.poll("jobs", false, None).await.unwrap().unwrap();
    assert_eq!(delivery.body, "after");
}

#[tokio::test]
async fn test_settling_after_reconnect_reports_transport_error() {
    let broker = LocalBroker::new();
    let connection = amqp_connection(&broker);
    let channel = connection.channel().await.unwrap();
    channel.declare(Queue::named("jobs")).await.unwrap();
    channel
        .publish("jobs", "jobs", Bytes::from_static(b"x"), &properties())
        .await
        .unwrap();
    let delivery = channel.poll("jobs", false, None).await.unwrap().unwrap();

    broker.drop_connections();
    let err = channel.ack(&delivery.delivery_tag).await.unwrap_err();
    assert!(matches!(
        err,
        MessagingError::Ack(AckError::Transport { .. })
    ));

    // The delivery went back to the queue when the session was severed
    let again = channel.poll("jobs", false, None).await.unwrap().unwrap();
    assert!(again.redelivered);
}
