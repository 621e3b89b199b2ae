//! Working queue / dead-letter queue pairs.

use std::sync::Arc;

use crate::broker::{BrokerChannel, QueueArguments, DEFAULT_EXCHANGE};
use crate::connection::ConnectionManager;
use crate::error::QueueError;

/// Suffix appended to a working queue's name to get its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = "_dead";

/// A working queue and the dead-letter queue paired with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub dead_letter_name: String,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        let name = name.into();
        Self {
            dead_letter_name: format!("{}{}", name, DEAD_LETTER_SUFFIX),
            name,
            durable,
        }
    }

    /// Arguments routing rejected messages through the default exchange to the dead-letter queue.
    pub fn arguments(&self) -> QueueArguments {
        QueueArguments {
            dead_letter_exchange: Some(DEFAULT_EXCHANGE.to_string()),
            dead_letter_routing_key: Some(self.dead_letter_name.clone()),
        }
    }

    /// Declares the working queue, then its dead-letter queue, on `channel`.
    ///
    /// Safe to repeat; a declaration that conflicts with an existing queue comes back
    /// from the broker unchanged.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), QueueError> {
        channel.queue_declare(&self.name, self.durable, &self.arguments()).await?;
        channel
            .queue_declare(&self.dead_letter_name, self.durable, &QueueArguments::default())
            .await?;
        log::info!(
            "Queue '{}' and dead-letter queue '{}' are set up (durable: {}).",
            self.name,
            self.dead_letter_name,
            self.durable
        );
        Ok(())
    }
}

/// Declares queue topology on a short-lived channel.
#[derive(Clone)]
pub struct QueueTopology {
    connections: Arc<ConnectionManager>,
}

impl QueueTopology {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Makes sure `name` and `<name>_dead` exist with the given durability.
    pub async fn ensure_queue(&self, name: &str, durable: bool) -> Result<QueueDescriptor, QueueError> {
        let descriptor = QueueDescriptor::new(name, durable);
        let channel = self.connections.open_channel().await?;

        let result = descriptor.declare(channel.as_ref()).await;
        if let Err(e) = channel.close().await {
            log::warn!("Failed to close topology channel for queue '{}': {}", name, e);
        }

        result.map(|_| descriptor).map_err(|e| {
            log::error!("Failed to declare queue '{}' with its dead-letter queue: {}", name, e);
            e
        })
    }
}
