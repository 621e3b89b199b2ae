//! The consumer that turns queued mail jobs into SMTP sends and attempt records.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AttemptSink, DeliveryAttemptRecord, MailJob, MailTransport};
use crate::consumer::{Consumer, ConsumerConfig};
use crate::envelope::RetryEnvelope;
use crate::error::{HandlerError, QueueError};
use crate::handler::MessageHandler;

/// Sends queued mail jobs and records every attempt.
///
/// Each job gets exactly one send attempt per delivery and one
/// [`DeliveryAttemptRecord`], written before the delivery is settled. A failed send
/// is terminal: the failure is recorded and the delivery acked, unless
/// `requeue_transient_failures` is on and the relay reported a transient error, in
/// which case the job is retried through the bounded retry path after the record is
/// written. When the record cannot be written the job is dead-lettered right away,
/// so a sink outage never causes the same mail to be sent again.
pub struct DispatchWorker {
    transport: Arc<dyn MailTransport>,
    sink: Arc<dyn AttemptSink>,
    requeue_transient_failures: bool,
}

impl DispatchWorker {
    pub fn new(transport: Arc<dyn MailTransport>, sink: Arc<dyn AttemptSink>) -> Self {
        Self {
            transport,
            sink,
            requeue_transient_failures: false,
        }
    }

    pub fn requeue_transient_failures(mut self, enabled: bool) -> Self {
        self.requeue_transient_failures = enabled;
        self
    }

    /// Consumes `config.queue_name` until cancelled.
    ///
    /// Runs on [`Consumer::consume_with_retry`], so payloads that cannot be decoded end
    /// up in the dead-letter queue after `config.retry_policy` is exhausted instead of
    /// blocking the queue.
    pub async fn run(
        self: Arc<Self>,
        consumer: &Consumer,
        config: &ConsumerConfig,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        log::info!("Dispatch worker starting on queue '{}'", config.queue_name);
        consumer.consume_with_retry(config, self, cancel).await
    }
}

#[async_trait]
impl MessageHandler for DispatchWorker {
    type MessageType = MailJob;

    async fn handle_message(&self, job: MailJob, envelope: &RetryEnvelope) -> Result<(), HandlerError> {
        let outcome = self.transport.send(&job).await;

        let record = match &outcome {
            Ok(()) => {
                log::info!("Email sent to {}", job.to);
                DeliveryAttemptRecord::sent(&job)
            }
            Err(e) => {
                log::error!(
                    "Failed to send email to {} (message {}): {}",
                    job.to,
                    envelope.message_id.as_deref().unwrap_or("-"),
                    e
                );
                DeliveryAttemptRecord::failed(&job, e.to_string())
            }
        };

        // the send already happened, so the job must not come back for another one
        self.sink.append(&record).await.map_err(|e| {
            log::error!("Failed to record delivery attempt for {}: {}", job.to, e);
            HandlerError::rejected(e)
        })?;

        match outcome {
            Err(e) if self.requeue_transient_failures && e.is_transient() => {
                log::warn!("Transient failure for {}, scheduling a retry", job.to);
                Err(HandlerError::failed(e))
            }
            _ => Ok(()),
        }
    }

    fn handler_name(&self) -> &str {
        "DispatchWorker"
    }
}
