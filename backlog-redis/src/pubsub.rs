//! Redis Pub/Sub support.

use futures::StreamExt;
use redis::Client;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{RedisConfig, RedisError, Result};

/// Buffered messages per subscription before the forwarder applies backpressure.
const SUBSCRIPTION_BUFFER: usize = 100;

/// A Redis Pub/Sub message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel name.
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

impl Message {
    /// Create a message.
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A subscription handle.
///
/// Dropping the handle unsubscribes: the forwarding task notices the closed
/// receiver and releases its connection.
pub struct Subscription {
    /// Receiver for messages.
    receiver: mpsc::Receiver<Message>,
    /// Channel name.
    channel: String,
}

impl Subscription {
    /// Wrap a receiver fed by any message source.
    pub fn new(receiver: mpsc::Receiver<Message>, channel: impl Into<String>) -> Self {
        Self {
            receiver,
            channel: channel.into(),
        }
    }

    /// A bounded sender/subscription pair for sources other than Redis.
    pub fn channel(name: impl Into<String>) -> (mpsc::Sender<Message>, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (tx, Self::new(rx, name))
    }

    /// Get the channel name.
    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Receive the next message. `None` once the source has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

/// Redis Pub/Sub client.
#[derive(Clone)]
pub struct PubSub {
    client: Client,
}

impl PubSub {
    /// Create a new Pub/Sub client.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.connection_url())
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Subscribe to a channel.
    ///
    /// Each subscription owns a dedicated connection, as Redis requires.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, subscription) = Subscription::channel(channel);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| RedisError::PubSub(e.to_string()))?;

        info!(channel = %channel, "Subscribed to Redis channel");

        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "Failed to get message payload");
                        continue;
                    }
                };

                let message = Message::new(msg.get_channel_name(), payload);
                debug!(channel = %message.channel, "Received pub/sub message");

                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!(channel = %channel_name, "Subscription closed");
        });

        Ok(subscription)
    }
}
