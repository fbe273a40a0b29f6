//! Error types for messaging operations.
//!
//! Every public operation returns [`MessagingError`]. Each variant carries the
//! entity name and transport kind involved so that a failure can be diagnosed
//! from the error alone. Lower layers use narrower enums ([`TransportError`],
//! [`CodecError`], [`DeclarationError`], [`AckError`], [`DecodeError`]) that are
//! wrapped as the error travels up.

use crate::config::TransportKind;
use std::time::Duration;
use thiserror::Error;

/// Standard result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Top-level error type surfaced by connections, channels and facades
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Connection over {transport} transport failed: {source}")]
    Connection {
        transport: TransportKind,
        #[source]
        source: TransportError,
    },

    #[error("Declaration of '{entity}' failed: {source}")]
    Declaration {
        entity: String,
        #[source]
        source: DeclarationError,
    },

    #[error("Publish to '{entity}' over {transport} transport failed: {source}")]
    Publish {
        entity: String,
        transport: TransportKind,
        #[source]
        source: PublishError,
    },

    #[error("Queue '{queue}' is empty")]
    Empty { queue: String },

    #[error("{operation} on '{entity}' timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        entity: String,
        duration: Duration,
    },

    #[error("Acknowledgement failed: {0}")]
    Ack(#[from] AckError),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("{capability} is not supported by the {transport} transport")]
    NotSupported {
        capability: &'static str,
        transport: TransportKind,
    },

    #[error("{resource} is closed")]
    Closed { resource: String },

    #[error("Transport operation '{operation}' on '{entity}' failed ({transport}): {source}")]
    Transport {
        operation: &'static str,
        entity: String,
        transport: TransportKind,
        #[source]
        source: TransportError,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl MessagingError {
    /// Check if error is transient and the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { source, .. } => source.is_transient(),
            Self::Declaration { .. } => false,
            Self::Publish { source, .. } => match source {
                PublishError::Encode(_) => false,
                PublishError::Transport(err) => err.is_transient(),
            },
            Self::Empty { .. } => true,
            Self::Timeout { .. } => true,
            Self::Ack(_) => false,
            Self::Decode(_) => false,
            Self::NotSupported { .. } => false,
            Self::Closed { .. } => false,
            Self::Transport { source, .. } => source.is_transient(),
            Self::Configuration(_) => false,
        }
    }

    /// Get suggested delay before retrying
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Connection { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Transport { source, .. } if source.is_connection_lost() => {
                Some(Duration::from_secs(5))
            }
            _ => None,
        }
    }

    /// True for the `Empty` control-flow signal of a non-blocking get
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }

    /// True for the `Timeout` control-flow signal of a bounded blocking call
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors surfaced by a single transport operation
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection refused: {message}")]
    ConnectionRefused { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Not connected")]
    NotConnected,

    #[error("Channel {channel_id} is not open")]
    ChannelNotOpen { channel_id: u64 },

    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("Entity not found: {name}")]
    NotFound { name: String },

    #[error("Unknown delivery tag: {delivery_tag}")]
    UnknownDeliveryTag { delivery_tag: String },

    #[error("Capability not supported: {capability}")]
    NotSupported { capability: &'static str },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl TransportError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ConnectionLost { .. } => true,
            Self::Timeout { .. } => true,
            Self::NotConnected => true,
            Self::ChannelNotOpen { .. } => false,
            Self::PreconditionFailed { .. } => false,
            Self::NotFound { .. } => false,
            Self::UnknownDeliveryTag { .. } => false,
            Self::NotSupported { .. } => false,
            Self::Backend(err) => err.is_transient(),
        }
    }

    /// Whether the live session is gone and the connection must be re-established
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } | Self::NotConnected => true,
            Self::Backend(BackendError::ConnectionLost(_)) => true,
            _ => false,
        }
    }
}

/// Errors reported by broker and key-value backends
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("access refused: {0}")]
    AccessRefused(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ConnectionLost(_))
    }

    /// Map backend error to the transport taxonomy
    pub fn into_transport_error(self) -> TransportError {
        match self {
            Self::Unavailable(message) => TransportError::ConnectionRefused { message },
            Self::AccessRefused(message) => TransportError::AuthenticationFailed { message },
            Self::ConnectionLost(message) => TransportError::ConnectionLost { message },
            Self::PreconditionFailed(message) => TransportError::PreconditionFailed { message },
            Self::NotFound(name) => TransportError::NotFound { name },
            other @ Self::Other(_) => TransportError::Backend(other),
        }
    }
}

/// Errors raised by the codec registry and its serializers/compressors
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("Unknown serializer: {name}")]
    UnknownSerializer { name: String },

    #[error("Unknown compressor: {name}")]
    UnknownCompressor { name: String },

    #[error("No serializer registered for content type '{content_type}'")]
    UnknownContentType { content_type: String },

    #[error("Encoding with '{codec}' failed: {reason}")]
    Encode { codec: String, reason: String },

    #[error("Decoding with '{codec}' failed: {reason}")]
    Decode { codec: String, reason: String },
}

/// Publish failures, split by the stage that failed
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("encoding failed: {0}")]
    Encode(#[from] CodecError),

    #[error("transport rejected publish: {0}")]
    Transport(#[from] TransportError),
}

/// Entity declaration failures
#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("'{name}' already declared as {existing}, cannot redeclare as {requested}")]
    Conflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Invalid entity name '{name}': {message}")]
    InvalidName { name: String, message: String },

    #[error("transport rejected declaration: {0}")]
    Transport(#[from] TransportError),
}

/// Acknowledgement failures
#[derive(Debug, Error)]
pub enum AckError {
    #[error("Message {delivery_tag} was already {state}")]
    AlreadyAcknowledged { delivery_tag: String, state: String },

    #[error("Channel for message {delivery_tag} is closed")]
    ChannelClosed { delivery_tag: String },

    #[error("Transport failed to settle message {delivery_tag}: {source}")]
    Transport {
        delivery_tag: String,
        #[source]
        source: TransportError,
    },
}

/// Payload decoding failures; the message stays valid for ack/reject
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("No serializer for content type '{content_type}'")]
    UnsupportedContentType { content_type: String },

    #[error("No compressor for compression '{compression}'")]
    UnsupportedCompression { compression: String },

    #[error("Decompression with '{compression}' failed: {message}")]
    Decompress {
        compression: String,
        message: String,
    },

    #[error("Payload is not valid '{content_type}': {message}")]
    Malformed {
        content_type: String,
        message: String,
    },

    #[error("Decoded payload does not match the requested type: {message}")]
    TypeMismatch { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("The {transport} transport requires a backend to be supplied")]
    MissingBackend { transport: TransportKind },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
