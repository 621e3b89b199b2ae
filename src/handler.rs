//! Defines the core trait for message handling logic.

use async_trait::async_trait;
use serde::Deserialize;

use crate::envelope::RetryEnvelope;
use crate::error::HandlerError;

/// A trait for processing messages from a queue.
///
/// Implement this trait for your specific message type and business logic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    /// Must be deserializable from JSON.
    type MessageType: for<'de> Deserialize<'de> + Send + Sync;

    /// Processes a single deserialized message.
    ///
    /// `envelope` describes the delivery: how many attempts already failed and the
    /// message identity. Returning an error hands the message to the consumer's
    /// failure path (retry, dead-letter or requeue, depending on the consume mode).
    async fn handle_message(
        &self,
        message: Self::MessageType,
        envelope: &RetryEnvelope,
    ) -> Result<(), HandlerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}
