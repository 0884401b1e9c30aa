//! Queue events via Redis Pub/Sub.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use tracing::{debug, warn};

use renderq_models::QueueEvent;

use crate::error::QueueResult;
use crate::queue::QueueConfig;

/// Stream of decoded queue events.
pub type EventStream = Pin<Box<dyn Stream<Item = QueueEvent> + Send>>;

/// Channel for publishing/subscribing to a queue's lifecycle events.
#[derive(Clone)]
pub struct EventChannel {
    client: redis::Client,
    channel: String,
}

impl EventChannel {
    pub fn new(client: redis::Client, config: &QueueConfig) -> Self {
        Self {
            client,
            channel: config.events_channel(),
        }
    }

    /// Create from a queue config, opening a dedicated client.
    pub fn open(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self::new(client, config))
    }

    /// Publish an event.
    pub async fn publish(&self, event: &QueueEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(event)?;

        debug!("Publishing {} event to {}", event_name(event), self.channel);
        conn.publish::<_, _, ()>(&self.channel, payload).await?;

        Ok(())
    }

    /// Subscribe to every event on the queue.
    ///
    /// The subscription is active once this returns, so callers can enqueue
    /// afterwards without missing events.
    pub async fn subscribe(&self) -> QueueResult<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Dropping undecodable queue event: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

fn event_name(event: &QueueEvent) -> &'static str {
    match event {
        QueueEvent::Progress { .. } => "progress",
        QueueEvent::Completed { .. } => "completed",
        QueueEvent::Failed { .. } => "failed",
    }
}
