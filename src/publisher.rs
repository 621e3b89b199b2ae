//! Publishing typed payloads to a queue.

use std::sync::Arc;

use serde::Serialize;

use crate::broker::{MessageProperties, DEFAULT_EXCHANGE};
use crate::connection::ConnectionManager;
use crate::error::QueueError;

/// Publishes JSON payloads through the default exchange, one short-lived channel per call.
#[derive(Clone)]
pub struct Publisher {
    connections: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Publishes `payload` to `queue_name` and returns the generated message id.
    ///
    /// The call returns once the broker confirmed the message. Failures are logged
    /// and returned; nothing is retried here, so a caller that retries may publish
    /// the same payload twice.
    pub async fn publish<T>(&self, queue_name: &str, payload: &T, durable: bool) -> Result<String, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|e| {
            log::error!("Failed to serialize message for queue '{}': {}", queue_name, e);
            QueueError::from(e)
        })?;

        let properties = MessageProperties::for_publish(durable);
        let message_id = properties.message_id.clone().unwrap_or_default();

        let channel = self.connections.open_channel().await.map_err(|e| {
            log::error!("Failed to publish message to queue '{}': {}", queue_name, e);
            e
        })?;

        let result = match channel.confirm_select().await {
            Ok(()) => {
                channel
                    .basic_publish(DEFAULT_EXCHANGE, queue_name, &body, &properties)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = channel.close().await {
            log::warn!("Failed to close publish channel for queue '{}': {}", queue_name, e);
        }

        match result {
            Ok(()) => {
                log::debug!("Message {} published to queue '{}'", message_id, queue_name);
                Ok(message_id)
            }
            Err(e) => {
                log::error!("Failed to publish message to queue '{}': {}", queue_name, e);
                Err(e)
            }
        }
    }
}
