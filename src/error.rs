use std::time::Duration;

use thiserror::Error;

/// Boxed error type used at collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for broker, publish and consume operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The broker could not be reached or the connection/channel is gone.
    #[error("broker connectivity error: {message}")]
    Connectivity { message: String },

    /// The broker refused an operation (inequivalent redeclare, unknown delivery tag, ...).
    #[error("broker refused the operation: {message}")]
    Broker { message: String },

    /// Payload could not be encoded before publishing.
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the message handler logic.
    #[error("message handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// Settings could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl QueueError {
    pub(crate) fn connectivity(message: impl Into<String>) -> Self {
        QueueError::Connectivity {
            message: message.into(),
        }
    }

    pub(crate) fn broker(message: impl Into<String>) -> Self {
        QueueError::Broker {
            message: message.into(),
        }
    }

    /// Whether the error means the connection or channel is unusable.
    ///
    /// AMQP protocol errors (e.g. `PRECONDITION_FAILED`) are broker refusals, everything
    /// else coming out of lapin is treated as a lost or unreachable broker.
    pub fn is_connectivity(&self) -> bool {
        match self {
            QueueError::Connectivity { .. } => true,
            QueueError::Lapin(e) => !matches!(e, lapin::Error::ProtocolError(_)),
            _ => false,
        }
    }
}

/// Failure raised while turning a delivery into a processed message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The delivery body is not a valid payload for the handler.
    #[error("failed to deserialize message: {0}")]
    Decode(#[source] serde_json::Error),

    /// The handler did not finish within the configured limit.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler reported a failure.
    #[error("{0}")]
    Failed(#[source] BoxError),

    /// The delivery must not be processed again. It is dead-lettered without retry.
    #[error("{0}")]
    Rejected(#[source] BoxError),
}

impl HandlerError {
    /// Wraps any error as a handler failure.
    pub fn failed(error: impl Into<BoxError>) -> Self {
        HandlerError::Failed(error.into())
    }

    /// Wraps any error as a failure that must not be retried.
    pub fn rejected(error: impl Into<BoxError>) -> Self {
        HandlerError::Rejected(error.into())
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Rejected(_))
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError::Failed(s.into())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError::Failed(s.into())
    }
}
