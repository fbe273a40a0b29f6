//! Tests for error types.

use super::*;

#[test]
fn test_transport_error_transience() {
    assert!(TransportError::ConnectionRefused {
        message: "refused".to_string(),
    }
    .is_transient());

    assert!(TransportError::ConnectionLost {
        message: "reset".to_string(),
    }
    .is_transient());

    assert!(!TransportError::AuthenticationFailed {
        message: "bad password".to_string(),
    }
    .is_transient());

    assert!(!TransportError::PreconditionFailed {
        message: "flags differ".to_string(),
    }
    .is_transient());

    assert!(TransportError::Backend(BackendError::Unavailable("down".to_string())).is_transient());
    assert!(!TransportError::Backend(BackendError::Other("boom".to_string())).is_transient());
}

#[test]
fn test_connection_lost_detection() {
    assert!(TransportError::NotConnected.is_connection_lost());
    assert!(TransportError::ConnectionLost {
        message: "eof".to_string()
    }
    .is_connection_lost());
    assert!(
        TransportError::Backend(BackendError::ConnectionLost("eof".to_string()))
            .is_connection_lost()
    );

    assert!(!TransportError::ChannelNotOpen { channel_id: 3 }.is_connection_lost());
    assert!(!TransportError::Timeout {
        duration: Duration::from_secs(1)
    }
    .is_connection_lost());
}

#[test]
fn test_backend_error_mapping() {
    assert!(matches!(
        BackendError::Unavailable("x".to_string()).into_transport_error(),
        TransportError::ConnectionRefused { .. }
    ));
    assert!(matches!(
        BackendError::AccessRefused("x".to_string()).into_transport_error(),
        TransportError::AuthenticationFailed { .. }
    ));
    assert!(matches!(
        BackendError::ConnectionLost("x".to_string()).into_transport_error(),
        TransportError::ConnectionLost { .. }
    ));
    assert!(matches!(
        BackendError::NotFound("orders".to_string()).into_transport_error(),
        TransportError::NotFound { name } if name == "orders"
    ));
    assert!(matches!(
        BackendError::Other("x".to_string()).into_transport_error(),
        TransportError::Backend(BackendError::Other(_))
    ));
}

#[test]
fn test_messaging_error_transience() {
    let lost = MessagingError::Transport {
        operation: "get",
        entity: "orders".to_string(),
        transport: TransportKind::Amqp,
        source: TransportError::ConnectionLost {
            message: "eof".to_string(),
        },
    };
    assert!(lost.is_transient());
    assert_eq!(lost.retry_after(), Some(Duration::from_secs(5)));

    let encode = MessagingError::Publish {
        entity: "orders".to_string(),
        transport: TransportKind::Memory,
        source: PublishError::Encode(CodecError::UnknownSerializer {
            name: "xml".to_string(),
        }),
    };
    assert!(!encode.is_transient());
    assert_eq!(encode.retry_after(), None);

    let closed = MessagingError::Closed {
        resource: "channel 1".to_string(),
    };
    assert!(!closed.is_transient());
}

#[test]
fn test_control_flow_signals() {
    let empty = MessagingError::Empty {
        queue: "orders".to_string(),
    };
    assert!(empty.is_empty());
    assert!(!empty.is_timeout());

    let timeout = MessagingError::Timeout {
        operation: "get",
        entity: "orders".to_string(),
        duration: Duration::from_millis(100),
    };
    assert!(timeout.is_timeout());
    assert!(!timeout.is_empty());
    assert_eq!(timeout.retry_after(), Some(Duration::from_secs(1)));
}

#[test]
fn test_error_messages_carry_context() {
    let err = MessagingError::Publish {
        entity: "log_queue".to_string(),
        transport: TransportKind::KeyValue,
        source: PublishError::Transport(TransportError::NotConnected),
    };
    let text = err.to_string();
    assert!(text.contains("log_queue"));
    assert!(text.contains("key_value"));

    let ack = MessagingError::from(AckError::AlreadyAcknowledged {
        delivery_tag: "7".to_string(),
        state: "acknowledged".to_string(),
    });
    assert_eq!(
        ack.to_string(),
        "Acknowledgement failed: Message 7 was already acknowledged"
    );
}
