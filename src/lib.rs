//! # Mail Dispatch
//! An asynchronous mail-dispatch pipeline over RabbitMQ: a managed broker connection,
//! durable publishing, consumers with bounded retry and dead-letter queue (DLQ)
//! routing, and a dispatch worker that sends mail over SMTP and records every attempt.

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod mail;
pub mod publisher;
pub mod retry;
pub mod topology;

// Re-export key components for easy access
pub use config::{BrokerSettings, EnvConfig, SmtpSettings, WorkerSettings};
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerConfig};
pub use envelope::RetryEnvelope;
pub use error::{HandlerError, QueueError};
pub use handler::MessageHandler;
pub use mail::{DeliveryAttemptRecord, DispatchWorker, MailJob};
pub use publisher::Publisher;
pub use retry::{RetryAction, RetryPolicy};
pub use topology::{QueueDescriptor, QueueTopology};
