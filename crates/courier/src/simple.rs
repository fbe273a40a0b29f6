//! Simple queue and buffer facades.
//!
//! Both types share one surface (`put`, `get`, `size`, `clear`, `close`) and
//! differ in the topology they declare:
//!
//! - [`SimpleQueue`] declares a durable direct exchange and a durable queue
//!   bound with the queue name as routing key. Messages wait in the queue
//!   until a consumer takes them.
//! - [`SimpleBuffer`] declares only a transient fanout exchange. Its consumer
//!   queue is private, auto-deleted and created when the consumer attaches,
//!   so messages published while nobody is attached are dropped.
//!
//! A facade either owns its channel (opened through
//! [`crate::Connection::simple_queue`] / [`crate::Connection::simple_buffer`])
//! or borrows one supplied by the caller. Closing only closes an owned
//! channel.

use crate::channel::Channel;
use crate::connection::Connection;
use crate::consumer::Consumer;
use crate::entity::{Exchange, ExchangeType, Queue};
use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::producer::{Producer, PutOptions};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Lifecycle of a facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    /// Constructed, topology not declared yet
    Created,
    /// Topology declared
    Open,
    /// Closed; every further operation fails
    Closed,
}

/// Channel handling and state shared by both facades
#[derive(Debug)]
struct FacadeCore {
    label: String,
    channel: Channel,
    owns_channel: bool,
    state: Mutex<FacadeState>,
}

impl FacadeCore {
    fn new(label: String, channel: Channel, owns_channel: bool) -> Self {
        Self {
            label,
            channel,
            owns_channel,
            state: Mutex::new(FacadeState::Created),
        }
    }

    fn state(&self) -> FacadeState {
        *self.state.lock()
    }

    fn ensure_not_closed(&self) -> MessagingResult<()> {
        if self.state() == FacadeState::Closed {
            return Err(MessagingError::Closed {
                resource: self.label.clone(),
            });
        }
        Ok(())
    }

    /// Mark the topology declared, unless the facade was closed meanwhile
    fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == FacadeState::Created {
            *state = FacadeState::Open;
        }
    }

    /// Move to Closed, returning false when it already was
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = *state != FacadeState::Closed;
        *state = FacadeState::Closed;
        was_open
    }

    async fn release_channel(&self) -> MessagingResult<()> {
        if self.owns_channel {
            self.channel.close().await?;
        }
        info!(facade = %self.label, owned_channel = self.owns_channel, "Closed");
        Ok(())
    }
}

// ============================================================================
// SimpleQueue
// ============================================================================

/// Durable work queue: every message is delivered to exactly one consumer
#[derive(Debug)]
pub struct SimpleQueue {
    core: FacadeCore,
    queue: Queue,
    producer: Producer,
    consumer: Consumer,
}

impl SimpleQueue {
    /// Open a queue on a channel of its own and declare its topology.
    ///
    /// The channel refers to `connection` weakly: keep the [`Connection`]
    /// alive while the queue is in use, otherwise every later operation
    /// fails with [`MessagingError::Closed`].
    pub async fn open(connection: &Connection, queue: impl Into<Queue>) -> MessagingResult<Self> {
        let channel = connection.channel().await?;
        let simple = Self::build(channel, queue.into(), true)?;
        simple.ensure_declared().await?;
        Ok(simple)
    }

    /// Queue on a caller-supplied channel; the topology is declared on first use
    pub fn with_channel(channel: Channel, queue: impl Into<Queue>) -> MessagingResult<Self> {
        Self::build(channel, queue.into(), false)
    }

    fn build(channel: Channel, queue: Queue, owns_channel: bool) -> MessagingResult<Self> {
        let (exchange, routing_key) = match &queue.exchange {
            Some(exchange) => (exchange.name.clone(), queue.routing_key.clone()),
            None => (String::new(), queue.name.clone()),
        };
        let producer = Producer::new(channel.clone(), exchange, routing_key)?;
        let consumer = Consumer::new(channel.clone(), queue.name.clone())?;
        Ok(Self {
            core: FacadeCore::new(format!("simple queue '{}'", queue.name), channel, owns_channel),
            queue,
            producer,
            consumer,
        })
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn channel(&self) -> &Channel {
        &self.core.channel
    }

    pub fn state(&self) -> FacadeState {
        self.core.state()
    }

    async fn ensure_declared(&self) -> MessagingResult<()> {
        self.core.ensure_not_closed()?;
        if self.core.state() == FacadeState::Created {
            self.core.channel.declare(self.queue.clone()).await?;
            self.core.mark_open();
        }
        Ok(())
    }

    /// Encode and publish `value`
    pub async fn put<T: Serialize + ?Sized>(&self, value: &T) -> MessagingResult<()> {
        self.put_with(value, &PutOptions::default()).await
    }

    pub async fn put_with<T: Serialize + ?Sized>(
        &self,
        value: &T,
        options: &PutOptions,
    ) -> MessagingResult<()> {
        self.ensure_declared().await?;
        self.producer.publish_with(value, options).await?;
        Ok(())
    }

    /// Fetch the next message, see [`Consumer::get`]
    pub async fn get(&self, block: bool, timeout: Option<Duration>) -> MessagingResult<Message> {
        self.ensure_declared().await?;
        self.consumer.get(block, timeout).await
    }

    pub async fn get_nowait(&self) -> MessagingResult<Message> {
        self.get(false, None).await
    }

    /// Number of ready messages
    pub async fn size(&self) -> MessagingResult<usize> {
        self.ensure_declared().await?;
        self.consumer.depth().await
    }

    /// Remove all ready messages, returning how many were removed
    pub async fn clear(&self) -> MessagingResult<usize> {
        self.ensure_declared().await?;
        self.consumer.purge().await
    }

    /// Close the facade; the channel is closed only if the facade opened it
    pub async fn close(&self) -> MessagingResult<()> {
        if !self.core.mark_closed() {
            return Ok(());
        }
        self.core.release_channel().await
    }
}

// ============================================================================
// SimpleBuffer
// ============================================================================

/// Volatile broadcast buffer: every attached consumer sees every message
/// published while it is attached
#[derive(Debug)]
pub struct SimpleBuffer {
    core: FacadeCore,
    name: String,
    exchange: Exchange,
    producer: Producer,
    consumer: tokio::sync::Mutex<Option<Consumer>>,
}

impl SimpleBuffer {
    /// Open a buffer on a channel of its own and declare its exchange.
    ///
    /// As with [`SimpleQueue::open`], the [`Connection`] must outlive the
    /// buffer. Dropping the buffer without [`SimpleBuffer::close`] still
    /// removes its consumer queue once the runtime gets to it.
    pub async fn open(connection: &Connection, name: &str) -> MessagingResult<Self> {
        let channel = connection.channel().await?;
        let buffer = Self::build(channel, name, true)?;
        buffer.ensure_declared().await?;
        Ok(buffer)
    }

    /// Buffer on a caller-supplied channel; declared on first use
    pub fn with_channel(channel: Channel, name: &str) -> MessagingResult<Self> {
        Self::build(channel, name, false)
    }

    fn build(channel: Channel, name: &str, owns_channel: bool) -> MessagingResult<Self> {
        let exchange = Exchange::new(name)
            .with_kind(ExchangeType::Fanout)
            .durable(false)
            .auto_delete(true);
        let producer = Producer::new(channel.clone(), name, name)?;
        Ok(Self {
            core: FacadeCore::new(format!("simple buffer '{}'", name), channel, owns_channel),
            name: name.to_string(),
            exchange,
            producer,
            consumer: tokio::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn channel(&self) -> &Channel {
        &self.core.channel
    }

    pub fn state(&self) -> FacadeState {
        self.core.state()
    }

    /// Name of the private consumer queue, once attached
    pub async fn consumer_queue(&self) -> Option<String> {
        self.consumer
            .lock()
            .await
            .as_ref()
            .map(|consumer| consumer.queue().to_string())
    }

    async fn ensure_declared(&self) -> MessagingResult<()> {
        self.core.ensure_not_closed()?;
        if self.core.state() == FacadeState::Created {
            self.core.channel.declare(self.exchange.clone()).await?;
            self.core.mark_open();
        }
        Ok(())
    }

    /// Attach the consumer: declare and bind the private consumer queue.
    ///
    /// Messages published before the first attach are not retained.
    /// Attaching again is a no-op.
    pub async fn subscribe(&self) -> MessagingResult<()> {
        self.attached().await.map(|_| ())
    }

    async fn attached(&self) -> MessagingResult<Consumer> {
        self.ensure_declared().await?;
        let mut slot = self.consumer.lock().await;
        if let Some(consumer) = slot.as_ref() {
            return Ok(consumer.clone());
        }

        let queue_name = format!("{}.buffer.{}", self.name, uuid::Uuid::new_v4().simple());
        let queue = Queue::new(queue_name.clone())
            .durable(false)
            .auto_delete(true)
            .bind_to(self.exchange.clone(), self.name.clone());
        self.core.channel.declare(queue).await?;

        let consumer = Consumer::new(self.core.channel.clone(), queue_name.clone())?;
        debug!(buffer = %self.name, queue = %queue_name, "Consumer attached");
        *slot = Some(consumer.clone());
        Ok(consumer)
    }

    pub async fn put<T: Serialize + ?Sized>(&self, value: &T) -> MessagingResult<()> {
        self.put_with(value, &PutOptions::default()).await
    }

    pub async fn put_with<T: Serialize + ?Sized>(
        &self,
        value: &T,
        options: &PutOptions,
    ) -> MessagingResult<()> {
        self.ensure_declared().await?;
        self.producer.publish_with(value, options).await?;
        Ok(())
    }

    /// Fetch the next message, attaching the consumer first if needed
    pub async fn get(&self, block: bool, timeout: Option<Duration>) -> MessagingResult<Message> {
        let consumer = self.attached().await?;
        consumer.get(block, timeout).await
    }

    pub async fn get_nowait(&self) -> MessagingResult<Message> {
        self.get(false, None).await
    }

    /// Messages waiting for the attached consumer; 0 while unattached
    pub async fn size(&self) -> MessagingResult<usize> {
        self.ensure_declared().await?;
        let consumer = self.consumer.lock().await.clone();
        match consumer {
            Some(consumer) => consumer.depth().await,
            None => Ok(0),
        }
    }

    pub async fn clear(&self) -> MessagingResult<usize> {
        self.ensure_declared().await?;
        let consumer = self.consumer.lock().await.clone();
        match consumer {
            Some(consumer) => consumer.purge().await,
            None => Ok(0),
        }
    }

    /// Close the facade and detach the consumer.
    ///
    /// On an owned channel the consumer queue goes away with the channel; on
    /// a borrowed one it is deleted explicitly and the channel stays open.
    pub async fn close(&self) -> MessagingResult<()> {
        if !self.core.mark_closed() {
            return Ok(());
        }
        let consumer = self.consumer.lock().await.take();
        if let (Some(consumer), false) = (consumer, self.core.owns_channel) {
            self.core.channel.delete_queue(consumer.queue()).await?;
        }
        self.core.release_channel().await
    }
}

#[cfg(test)]
#[path = "simple_tests.rs"]
mod tests;
