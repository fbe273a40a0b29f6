//! Connection lifecycle.
//!
//! A [`Connection`] owns at most one live transport session. The session is
//! created lazily on first use and replaced when it is lost; every
//! replacement starts a new session epoch. Channels remember the epoch they
//! were bound in and re-bind themselves when it changes.
//!
//! ```text
//! Disconnected ──use──▶ Connecting ──ok──▶ Connected
//!       ▲                   │                  │
//!       │                   └─err──▶ Failed ◀──┘ session lost
//!       │                              │
//!       └────── close() ◀──────────────┴──use──▶ Connecting
//! ```

use crate::backend::{AmqpBroker, KeyValueStore};
use crate::channel::Channel;
use crate::codec::CodecRegistry;
use crate::config::{ConnectionConfig, TransportKind};
use crate::entity::Queue;
use crate::error::{ConfigurationError, MessagingError, MessagingResult, TransportError};
use crate::retry::RetryPolicy;
use crate::simple::{SimpleBuffer, SimpleQueue};
use crate::transport::{MemoryBroker, Session, Transport};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// A live session tagged with the epoch it was established in
pub(crate) struct LiveSession {
    pub(crate) epoch: u64,
    pub(crate) session: Session,
}

pub(crate) struct ConnectionInner {
    config: ConnectionConfig,
    transport: Transport,
    codecs: Arc<CodecRegistry>,
    retry: RetryPolicy,
    /// Serializes every state transition; holds the last issued epoch
    transition: tokio::sync::Mutex<u64>,
    state: Mutex<ConnectionState>,
    session: ArcSwapOption<LiveSession>,
    next_channel: AtomicU64,
}

/// Handle to a messaging connection; clones share the same session
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start building a connection for `config`
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(config)
    }

    /// Connection to a private in-memory broker with default settings
    pub fn memory() -> Self {
        Self::with_memory_broker(MemoryBroker::new())
    }

    /// Connection to a shared in-memory broker with default settings
    pub fn with_memory_broker(broker: MemoryBroker) -> Self {
        let config = ConnectionConfig::for_transport(TransportKind::Memory);
        Self::from_parts(
            config.clone(),
            Transport::memory(broker),
            Arc::new(CodecRegistry::new()),
            RetryPolicy::from(&config.retry),
        )
    }

    fn from_parts(
        config: ConnectionConfig,
        transport: Transport,
        codecs: Arc<CodecRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                transport,
                codecs,
                retry,
                transition: tokio::sync::Mutex::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                session: ArcSwapOption::empty(),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Port used when the configuration does not name one
    pub fn default_port(&self) -> Option<u16> {
        self.transport_kind().default_port()
    }

    /// Current session epoch, `None` while no session is live
    pub fn epoch(&self) -> Option<u64> {
        self.inner.session.load().as_ref().map(|live| live.epoch)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock() = state;
    }

    /// Establish the session if it is not live yet
    pub async fn connect(&self) -> MessagingResult<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Return the live session, connecting first when there is none.
    ///
    /// This is the only place that moves the state machine forward. The
    /// first attempt is followed by up to `retry.max_retries` more for
    /// transient failures, each bounded by the connect timeout.
    pub(crate) async fn ensure_connected(&self) -> MessagingResult<Arc<LiveSession>> {
        if let Some(live) = self.inner.session.load_full() {
            return Ok(live);
        }

        let mut epoch = self.inner.transition.lock().await;
        if let Some(live) = self.inner.session.load_full() {
            return Ok(live);
        }

        let config = &self.inner.config;
        let timeout = config.connect_timeout();
        let kind = self.transport_kind();
        self.set_state(ConnectionState::Connecting);
        debug!(transport = %kind, address = %config.display_address(), "Connecting");

        let mut attempt = 0;
        let last_error = loop {
            let result = tokio::time::timeout(timeout, self.inner.transport.connect(config)).await;
            let err = match result {
                Ok(Ok(session)) => {
                    *epoch += 1;
                    let live = Arc::new(LiveSession {
                        epoch: *epoch,
                        session,
                    });
                    self.inner.session.store(Some(live.clone()));
                    self.set_state(ConnectionState::Connected);
                    info!(
                        transport = %kind,
                        address = %config.display_address(),
                        epoch = *epoch,
                        "Connected"
                    );
                    return Ok(live);
                }
                Ok(Err(err)) => err,
                Err(_) => TransportError::Timeout { duration: timeout },
            };

            if !err.is_transient() || !self.inner.retry.should_retry(attempt) {
                break err;
            }

            let delay = self.inner.retry.calculate_delay(attempt);
            warn!(
                transport = %kind,
                attempt = attempt + 1,
                max_attempts = self.inner.retry.total_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connect attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        self.set_state(ConnectionState::Failed);
        warn!(transport = %kind, error = %last_error, "Connection failed");
        Err(match last_error {
            TransportError::Timeout { duration } => MessagingError::Timeout {
                operation: "connect",
                entity: config.display_address(),
                duration,
            },
            source => MessagingError::Connection {
                transport: kind,
                source,
            },
        })
    }

    /// Drop the session of `epoch` after a transport reported it lost.
    ///
    /// The next operation reconnects. A stale epoch is ignored so that a
    /// session established in the meantime survives.
    pub(crate) async fn invalidate(&self, epoch: u64, reason: &TransportError) {
        let _transition = self.inner.transition.lock().await;
        let current = self.inner.session.load_full();
        let Some(live) = current.filter(|live| live.epoch == epoch) else {
            return;
        };

        self.inner.session.store(None);
        self.set_state(ConnectionState::Failed);
        warn!(
            transport = %self.transport_kind(),
            epoch,
            error = %reason,
            "Session lost, reconnecting on next use"
        );
        if let Err(err) = live.session.close().await {
            debug!(error = %err, "Closing the lost session failed");
        }
    }

    /// Open a new channel, connecting first if needed
    pub async fn channel(&self) -> MessagingResult<Channel> {
        self.ensure_connected().await?;
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel = Channel::new(self, id);
        channel.bind().await?;
        Ok(channel)
    }

    /// Durable work queue named `name`, on a channel of its own
    pub async fn simple_queue(&self, name: impl Into<Queue>) -> MessagingResult<SimpleQueue> {
        SimpleQueue::open(self, name).await
    }

    /// Volatile broadcast buffer named `name`, on a channel of its own
    pub async fn simple_buffer(&self, name: &str) -> MessagingResult<SimpleBuffer> {
        SimpleBuffer::open(self, name).await
    }

    /// Close the session; a later use reconnects
    pub async fn close(&self) -> MessagingResult<()> {
        let _transition = self.inner.transition.lock().await;
        let previous = self.inner.session.swap(None);
        self.set_state(ConnectionState::Disconnected);

        if let Some(live) = previous {
            info!(transport = %self.transport_kind(), epoch = live.epoch, "Closing connection");
            live.session
                .close()
                .await
                .map_err(|source| MessagingError::Transport {
                    operation: "close",
                    entity: self.inner.config.display_address(),
                    transport: self.transport_kind(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport_kind())
            .field("address", &self.inner.config.display_address())
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Builder supplying the backend a transport needs
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    amqp_broker: Option<Arc<dyn AmqpBroker>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    memory_broker: Option<MemoryBroker>,
    codecs: Option<Arc<CodecRegistry>>,
    retry: Option<RetryPolicy>,
}

impl ConnectionBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            amqp_broker: None,
            key_value_store: None,
            memory_broker: None,
            codecs: None,
            retry: None,
        }
    }

    pub fn amqp_broker(mut self, broker: Arc<dyn AmqpBroker>) -> Self {
        self.amqp_broker = Some(broker);
        self
    }

    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    pub fn memory_broker(mut self, broker: MemoryBroker) -> Self {
        self.memory_broker = Some(broker);
        self
    }

    /// Use a shared codec registry instead of a default one
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Override the reconnect policy derived from the configuration
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<Connection, ConfigurationError> {
        self.config.validate()?;

        let kind = self.config.transport;
        let transport = match kind {
            TransportKind::Amqp => Transport::amqp(
                self.amqp_broker
                    .ok_or(ConfigurationError::MissingBackend { transport: kind })?,
            ),
            TransportKind::KeyValue => Transport::key_value(
                self.key_value_store
                    .ok_or(ConfigurationError::MissingBackend { transport: kind })?,
            ),
            TransportKind::Memory => Transport::memory(self.memory_broker.unwrap_or_default()),
        };

        let codecs = self.codecs.unwrap_or_else(|| Arc::new(CodecRegistry::new()));
        codecs
            .serializer(&self.config.default_serializer)
            .map_err(|e| ConfigurationError::Invalid {
                message: e.to_string(),
            })?;
        if let Some(compression) = &self.config.default_compression {
            codecs
                .compressor(compression)
                .map_err(|e| ConfigurationError::Invalid {
                    message: e.to_string(),
                })?;
        }

        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from(&self.config.retry));
        Ok(Connection::from_parts(self.config, transport, codecs, retry))
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
