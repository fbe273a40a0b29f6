//! Polling consumer.

use crate::channel::Channel;
use crate::codec::CodecRegistry;
use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fetches messages from one queue
#[derive(Debug, Clone)]
pub struct Consumer {
    channel: Channel,
    queue: String,
    codecs: Arc<CodecRegistry>,
}

impl Consumer {
    pub fn new(channel: Channel, queue: impl Into<String>) -> MessagingResult<Self> {
        let codecs = channel.connection()?.codecs().clone();
        Ok(Self {
            channel,
            queue: queue.into(),
            codecs,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fetch the next message.
    ///
    /// Without `block`, an empty queue yields [`MessagingError::Empty`].
    /// With `block`, waits until a message arrives or `timeout` elapses
    /// ([`MessagingError::Timeout`]); `None` waits indefinitely.
    pub async fn get(&self, block: bool, timeout: Option<Duration>) -> MessagingResult<Message> {
        let delivery = self.channel.poll(&self.queue, block, timeout).await?;
        let Some(delivery) = delivery else {
            return Err(MessagingError::Empty {
                queue: self.queue.clone(),
            });
        };

        debug!(
            queue = %self.queue,
            delivery_tag = %delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Message received"
        );
        Ok(Message::new(delivery, self.channel.clone(), self.codecs.clone()))
    }

    pub async fn get_nowait(&self) -> MessagingResult<Message> {
        self.get(false, None).await
    }

    /// Ready messages in the queue
    pub async fn depth(&self) -> MessagingResult<usize> {
        self.channel.queue_depth(&self.queue).await
    }

    /// Remove all ready messages, returning how many were removed
    pub async fn purge(&self) -> MessagingResult<usize> {
        let purged = self.channel.purge(&self.queue).await?;
        debug!(queue = %self.queue, purged, "Queue purged");
        Ok(purged)
    }
}
