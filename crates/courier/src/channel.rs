//! Channels: lightweight, independently closable lanes on a connection.
//!
//! A channel is bound to the session epoch it was opened in. When the
//! connection replaces its session, the next operation on the channel opens
//! a fresh transport channel and replays every declaration made so far, so
//! callers keep using the same [`Channel`] value across reconnects.

use crate::connection::{Connection, ConnectionInner, LiveSession};
use crate::config::TransportKind;
use crate::entity::Entity;
use crate::error::{
    AckError, DeclarationError, MessagingError, MessagingResult, PublishError, TransportError,
};
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};
use crate::transport::ChannelId;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transport channel opened in one session epoch
struct Bound {
    live: Arc<LiveSession>,
    channel: ChannelId,
}

struct ChannelInner {
    id: u64,
    transport: TransportKind,
    connection: Weak<ConnectionInner>,
    bound: ArcSwapOption<Bound>,
    rebind: tokio::sync::Mutex<()>,
    /// Declarations in the order they were made, replayed on re-bind
    declared: Mutex<Vec<Entity>>,
    closed: AtomicBool,
}

/// Handle to a channel; clones refer to the same channel
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(connection: &Connection, id: u64) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                transport: connection.transport_kind(),
                connection: connection.downgrade(),
                bound: ArcSwapOption::empty(),
                rebind: tokio::sync::Mutex::new(()),
                declared: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Entities declared on this channel, in declaration order
    pub fn declared(&self) -> Vec<Entity> {
        self.inner.declared.lock().clone()
    }

    /// Owning connection, if it is still alive
    pub fn connection(&self) -> MessagingResult<Connection> {
        self.inner
            .connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or_else(|| MessagingError::Closed {
                resource: "connection".to_string(),
            })
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(MessagingError::Closed {
                resource: format!("channel {}", self.inner.id),
            });
        }
        Ok(())
    }

    pub(crate) async fn bind(&self) -> MessagingResult<()> {
        self.bound().await.map(|_| ())
    }

    /// Transport channel for the current session, re-binding when the
    /// session changed since the last operation
    async fn bound(&self) -> MessagingResult<Arc<Bound>> {
        self.ensure_open()?;
        let connection = self.connection()?;
        let live = connection.ensure_connected().await?;

        if let Some(bound) = self.inner.bound.load_full() {
            if bound.live.epoch == live.epoch {
                return Ok(bound);
            }
        }

        let _rebind = self.inner.rebind.lock().await;
        let previous = self.inner.bound.load_full();
        if let Some(bound) = &previous {
            if bound.live.epoch == live.epoch {
                return Ok(bound.clone());
            }
        }

        let epoch = live.epoch;
        let channel = match live.session.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                self.handle_failure(epoch, &err).await;
                return Err(self.transport_error("open_channel", "channel", err));
            }
        };
        let bound = Arc::new(Bound { live, channel });

        let declared = self.declared();
        for entity in &declared {
            if let Err(err) = bound.live.session.declare(channel, entity).await {
                self.handle_failure(epoch, &err).await;
                return Err(MessagingError::Declaration {
                    entity: entity.name(),
                    source: DeclarationError::Transport(err),
                });
            }
        }

        if previous.is_some() {
            info!(
                channel = self.inner.id,
                epoch,
                replayed = declared.len(),
                "Channel re-bound to new session"
            );
        }
        self.inner.bound.store(Some(bound.clone()));
        Ok(bound)
    }

    async fn handle_failure(&self, epoch: u64, err: &TransportError) {
        if !err.is_connection_lost() {
            return;
        }
        if let Ok(connection) = self.connection() {
            connection.invalidate(epoch, err).await;
        }
    }

    fn transport_error(
        &self,
        operation: &'static str,
        entity: &str,
        err: TransportError,
    ) -> MessagingError {
        match err {
            TransportError::Timeout { duration } => MessagingError::Timeout {
                operation,
                entity: entity.to_string(),
                duration,
            },
            TransportError::NotSupported { capability } => MessagingError::NotSupported {
                capability,
                transport: self.inner.transport,
            },
            source => MessagingError::Transport {
                operation,
                entity: entity.to_string(),
                transport: self.inner.transport,
                source,
            },
        }
    }

    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        entity: &str,
        op: F,
    ) -> MessagingResult<T>
    where
        F: FnOnce(Arc<Bound>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let bound = self.bound().await?;
        let epoch = bound.live.epoch;
        match op(bound).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.handle_failure(epoch, &err).await;
                Err(self.transport_error(operation, entity, err))
            }
        }
    }

    /// Declare an exchange, queue or binding.
    ///
    /// A queue bound to an exchange also declares that exchange and the
    /// binding. Re-declaring an identical entity is a no-op; re-declaring a
    /// name with different flags fails without reaching the transport.
    pub async fn declare(&self, entity: impl Into<Entity>) -> MessagingResult<()> {
        let entity = entity.into();
        self.ensure_open()?;
        entity.validate().map_err(|source| MessagingError::Declaration {
            entity: entity.name(),
            source,
        })?;

        let parts = match entity {
            Entity::Queue(queue) => {
                let mut parts = Vec::with_capacity(3);
                if let Some(exchange) = &queue.exchange {
                    parts.push(Entity::Exchange(exchange.clone()));
                }
                let binding = queue.binding();
                parts.push(Entity::Queue(queue));
                if let Some(binding) = binding {
                    parts.push(Entity::Binding(binding));
                }
                parts
            }
            other => vec![other],
        };

        for part in parts {
            self.declare_one(part).await?;
        }
        Ok(())
    }

    async fn declare_one(&self, entity: Entity) -> MessagingResult<()> {
        let key = entity.cache_key();
        {
            let declared = self.inner.declared.lock();
            if let Some(existing) = declared.iter().find(|e| e.cache_key() == key) {
                return existing
                    .check_compatible(&entity)
                    .map_err(|source| MessagingError::Declaration {
                        entity: entity.name(),
                        source,
                    });
            }
        }

        let bound = self.bound().await?;
        let epoch = bound.live.epoch;
        if let Err(err) = bound.live.session.declare(bound.channel, &entity).await {
            self.handle_failure(epoch, &err).await;
            return Err(MessagingError::Declaration {
                entity: entity.name(),
                source: DeclarationError::Transport(err),
            });
        }

        debug!(channel = self.inner.id, entity = %entity.name(), "Declared");
        self.inner.declared.lock().push(entity);
        Ok(())
    }

    /// Publish an already encoded body
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> MessagingResult<()> {
        let target = if exchange.is_empty() { routing_key } else { exchange };
        let bound = self.bound().await?;
        let epoch = bound.live.epoch;

        if let Err(err) = bound
            .live
            .session
            .publish(bound.channel, exchange, routing_key, body, properties)
            .await
        {
            self.handle_failure(epoch, &err).await;
            return Err(MessagingError::Publish {
                entity: target.to_string(),
                transport: self.inner.transport,
                source: PublishError::Transport(err),
            });
        }
        Ok(())
    }

    /// Fetch the next delivery from `queue`; see [`crate::transport::Session::poll`]
    pub async fn poll(
        &self,
        queue: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> MessagingResult<Option<RawDelivery>> {
        self.execute("get", queue, |bound| async move {
            bound.live.session.poll(bound.channel, queue, block, timeout).await
        })
        .await
    }

    pub(crate) async fn ack(&self, tag: &DeliveryTag) -> MessagingResult<()> {
        self.settle(tag, None).await
    }

    pub(crate) async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> MessagingResult<()> {
        self.settle(tag, Some(requeue)).await
    }

    async fn settle(&self, tag: &DeliveryTag, reject: Option<bool>) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(AckError::ChannelClosed {
                delivery_tag: tag.to_string(),
            }
            .into());
        }

        let bound = self.bound().await?;
        let epoch = bound.live.epoch;
        let result = match reject {
            None => bound.live.session.ack(bound.channel, tag).await,
            Some(requeue) => bound.live.session.reject(bound.channel, tag, requeue).await,
        };

        if let Err(source) = result {
            self.handle_failure(epoch, &source).await;
            return Err(AckError::Transport {
                delivery_tag: tag.to_string(),
                source,
            }
            .into());
        }
        Ok(())
    }

    /// Ready messages in `queue`
    pub async fn queue_depth(&self, queue: &str) -> MessagingResult<usize> {
        self.execute("queue_depth", queue, |bound| async move {
            bound.live.session.queue_depth(bound.channel, queue).await
        })
        .await
    }

    /// Remove all ready messages from `queue`, returning how many were removed
    pub async fn purge(&self, queue: &str) -> MessagingResult<usize> {
        self.execute("purge", queue, |bound| async move {
            bound.live.session.purge(bound.channel, queue).await
        })
        .await
    }

    /// Delete `queue` and forget its cached declaration
    pub async fn delete_queue(&self, queue: &str) -> MessagingResult<()> {
        self.execute("delete_queue", queue, |bound| async move {
            bound.live.session.delete_queue(bound.channel, queue).await
        })
        .await?;

        self.inner.declared.lock().retain(|entity| match entity {
            Entity::Queue(q) => q.name != queue,
            Entity::Binding(b) => b.queue != queue,
            Entity::Exchange(_) => true,
        });
        Ok(())
    }

    /// Close the channel; auto-delete queues it declared are deleted.
    ///
    /// Closing twice is a no-op. The connection stays open.
    pub async fn close(&self) -> MessagingResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(bound) = self.inner.bound.swap(None) else {
            return Ok(());
        };

        let current_epoch = self.connection().ok().and_then(|c| c.epoch());
        if current_epoch != Some(bound.live.epoch) {
            debug!(channel = self.inner.id, "Channel session already gone");
            return Ok(());
        }

        let transient = auto_delete_queues(&self.declared());
        let epoch = bound.live.epoch;
        if let Err(err) = release(self.inner.id, &bound, transient).await {
            self.handle_failure(epoch, &err).await;
            return Err(self.transport_error("close_channel", "channel", err));
        }
        debug!(channel = self.inner.id, "Channel closed");
        Ok(())
    }
}

/// Names of the auto-delete queues among `declared`
fn auto_delete_queues(declared: &[Entity]) -> Vec<String> {
    declared
        .iter()
        .filter_map(|entity| match entity {
            Entity::Queue(queue) if queue.auto_delete => Some(queue.name.clone()),
            _ => None,
        })
        .collect()
}

/// Delete `transient` queues, then close the transport channel
async fn release(id: u64, bound: &Bound, transient: Vec<String>) -> Result<(), TransportError> {
    for queue in transient {
        if let Err(err) = bound.live.session.delete_queue(bound.channel, &queue).await {
            warn!(
                channel = id,
                queue = %queue,
                error = %err,
                "Could not delete auto-delete queue"
            );
        }
    }
    bound.live.session.close_channel(bound.channel).await
}

/// Releases an unclosed channel in the background once its last handle is gone
impl Drop for ChannelInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(bound) = self.bound.swap(None) else {
            return;
        };
        if let Some(connection) = self.connection.upgrade().map(Connection::from_inner) {
            if connection.epoch() != Some(bound.live.epoch) {
                return;
            }
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = self.id, "Channel dropped outside a runtime; not released");
            return;
        };

        let id = self.id;
        let transient = auto_delete_queues(self.declared.get_mut());
        runtime.spawn(async move {
            match release(id, &bound, transient).await {
                Ok(()) => debug!(channel = id, "Dropped channel released"),
                Err(err) => debug!(channel = id, error = %err, "Dropped channel not released"),
            }
        });
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("closed", &self.is_closed())
            .field("declared", &self.inner.declared.lock().len())
            .finish()
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
