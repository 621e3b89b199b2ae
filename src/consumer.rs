//! Queue consumers and their configuration.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerChannel, Delivery, DeliveryStream, DEFAULT_EXCHANGE};
use crate::connection::ConnectionManager;
use crate::envelope::RetryEnvelope;
use crate::error::{HandlerError, QueueError};
use crate::handler::MessageHandler;
use crate::retry::{RetryAction, RetryPolicy};
use crate::topology::QueueDescriptor;

/// Configuration for a subscription.
///
/// Use the `ConsumerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// The name of the queue to consume messages from.
    pub queue_name: String,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    /// The number of messages to fetch from the server at a time (QoS prefetch count).
    pub prefetch_count: u16,
    /// Durability used when the queue pair is declared on startup.
    pub durable: bool,
    /// Let the broker settle deliveries on send. Only honoured by [`Consumer::consume`].
    pub auto_ack: bool,
    /// Retry bound used by [`Consumer::consume_with_retry`].
    pub retry_policy: RetryPolicy,
    /// Upper bound for one handler invocation.
    pub handler_timeout: Option<Duration>,
}

impl ConsumerConfig {
    /// Creates a new `ConsumerConfigBuilder` for the given queue.
    pub fn builder(queue_name: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new(queue_name.into())
    }
}

/// A builder for creating `ConsumerConfig` instances.
pub struct ConsumerConfigBuilder {
    queue_name: String,
    consumer_tag: Option<String>,
    prefetch_count: Option<u16>,
    durable: Option<bool>,
    auto_ack: bool,
    retry_policy: Option<RetryPolicy>,
    handler_timeout: Option<Duration>,
}

impl ConsumerConfigBuilder {
    fn new(queue_name: String) -> Self {
        Self {
            queue_name,
            consumer_tag: None,
            prefetch_count: None,
            durable: None,
            auto_ack: false,
            retry_policy: None,
            handler_timeout: None,
        }
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Defaults to `true`.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Sets the maximum number of attempts before dead-lettering.
    /// Defaults to 3.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy = Some(RetryPolicy::new(max_retries));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Fails a handler invocation that runs longer than `timeout`.
    /// Unbounded if not set.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Builds the final `ConsumerConfig`, applying defaults for any unset options.
    pub fn build(self) -> ConsumerConfig {
        let queue_name = self.queue_name;
        ConsumerConfig {
            consumer_tag: self
                .consumer_tag
                .unwrap_or_else(|| format!("{}_consumer", queue_name)),
            prefetch_count: self.prefetch_count.unwrap_or(1),
            durable: self.durable.unwrap_or(true),
            auto_ack: self.auto_ack,
            retry_policy: self.retry_policy.unwrap_or_default(),
            handler_timeout: self.handler_timeout,
            queue_name,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Acked,
    Retried { attempt: u32 },
    DeadLettered { attempts: u32 },
    Requeued,
    Dropped,
}

/// Subscribes handlers to queues.
///
/// Each subscription gets its own long-lived channel and processes its deliveries
/// one at a time, in the order the broker hands them out. Different subscriptions
/// run independently.
#[derive(Clone)]
pub struct Consumer {
    connections: Arc<ConnectionManager>,
}

impl Consumer {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Consumes with bounded retries and dead-lettering.
    ///
    /// A delivery that fails to decode, fails in the handler or times out is
    /// republished with an incremented `x-retries` header and the original is acked.
    /// Once the count reaches the policy's `max_retries` it is rejected without
    /// requeue instead, which moves it to `<queue>_dead`. [`HandlerError::Rejected`]
    /// goes there on the first failure. Handler failures never end
    /// the subscription; broker errors do.
    ///
    /// Runs until `cancel` fires (returns `Ok`) or the subscription fails.
    pub async fn consume_with_retry<H>(
        &self,
        config: &ConsumerConfig,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>
    where
        H: MessageHandler + 'static,
    {
        let descriptor = QueueDescriptor::new(&config.queue_name, config.durable);
        let channel = self.connections.open_channel().await?;

        let result = async {
            // republished retries must be on the broker before the original is acked
            channel.confirm_select().await?;
            let deliveries = Self::subscribe(channel.as_ref(), &descriptor, config, false).await?;
            Self::drive(config, deliveries, &cancel, |delivery| {
                let channel = channel.as_ref();
                let descriptor = &descriptor;
                let handler = handler.as_ref();
                async move { Self::process_with_retry(channel, descriptor, config, handler, delivery).await }
            })
            .await
        }
        .await;

        Self::close_channel(channel.as_ref(), &config.queue_name).await;
        result
    }

    /// Consumes with single-attempt semantics.
    ///
    /// Successful deliveries are acked; failed ones are nacked with requeue, so the
    /// broker redelivers them without limit. [`HandlerError::Rejected`] is rejected
    /// without requeue and lands in `<queue>_dead`. With `auto_ack` the broker settles
    /// deliveries itself and failures are only logged.
    ///
    /// Runs until `cancel` fires (returns `Ok`) or the subscription fails.
    pub async fn consume<H>(
        &self,
        config: &ConsumerConfig,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>
    where
        H: MessageHandler + 'static,
    {
        let descriptor = QueueDescriptor::new(&config.queue_name, config.durable);
        let channel = self.connections.open_channel().await?;

        let result = async {
            let deliveries =
                Self::subscribe(channel.as_ref(), &descriptor, config, config.auto_ack).await?;
            Self::drive(config, deliveries, &cancel, |delivery| {
                let channel = channel.as_ref();
                let handler = handler.as_ref();
                async move { Self::process_once(channel, config, handler, delivery).await }
            })
            .await
        }
        .await;

        Self::close_channel(channel.as_ref(), &config.queue_name).await;
        result
    }

    async fn subscribe(
        channel: &dyn BrokerChannel,
        descriptor: &QueueDescriptor,
        config: &ConsumerConfig,
        auto_ack: bool,
    ) -> Result<DeliveryStream, QueueError> {
        descriptor.declare(channel).await?;

        channel.basic_qos(config.prefetch_count).await?;
        log::info!("QoS prefetch count set to {}", config.prefetch_count);

        let deliveries = channel
            .basic_consume(&config.queue_name, &config.consumer_tag, auto_ack)
            .await?;
        log::info!(
            "Consumer started with tag '{}' on queue '{}'. Waiting for messages...",
            config.consumer_tag,
            config.queue_name
        );
        Ok(deliveries)
    }

    /// Feeds deliveries to `process` one at a time until cancellation or failure.
    ///
    /// Cancellation is only observed between deliveries, so a handler that already
    /// started runs to completion.
    async fn drive<F, Fut>(
        config: &ConsumerConfig,
        mut deliveries: DeliveryStream,
        cancel: &CancellationToken,
        mut process: F,
    ) -> Result<(), QueueError>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: std::future::Future<Output = Result<DeliveryOutcome, QueueError>>,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Consumer '{}' cancelled, stopping.", config.consumer_tag);
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    log::error!("Consumer '{}' delivery stream failed: {}", config.consumer_tag, e);
                    return Err(e);
                }
                None => {
                    log::warn!("Consumer '{}' delivery stream ended.", config.consumer_tag);
                    return Err(QueueError::connectivity(format!(
                        "delivery stream for queue '{}' closed by the broker",
                        config.queue_name
                    )));
                }
            };

            let delivery_tag = delivery.delivery_tag;
            let outcome = process(delivery).await?;
            log::debug!("Delivery {} settled: {:?}", delivery_tag, outcome);
        }
    }

    async fn process_with_retry<H>(
        channel: &dyn BrokerChannel,
        descriptor: &QueueDescriptor,
        config: &ConsumerConfig,
        handler: &H,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome, QueueError>
    where
        H: MessageHandler,
    {
        let delivery_tag = delivery.delivery_tag;
        let envelope = RetryEnvelope::from_properties(&delivery.properties);

        let error = match invoke(handler, &delivery.data, &envelope, config.handler_timeout).await {
            Ok(()) => {
                channel.basic_ack(delivery_tag).await?;
                log::info!("Message processed successfully. Tag: {}", delivery_tag);
                return Ok(DeliveryOutcome::Acked);
            }
            Err(e) => e,
        };

        log::error!(
            "Failed to process message from queue '{}' with '{}'. Tag: {}, Error: {}",
            descriptor.name,
            handler.handler_name(),
            delivery_tag,
            error
        );

        let next = envelope.next_attempt();
        if !error.is_retryable() {
            channel.basic_reject(delivery_tag, false).await?;
            log::warn!(
                "Message sent to '{}' without retry. Error: {}",
                descriptor.dead_letter_name,
                error
            );
            return Ok(DeliveryOutcome::DeadLettered {
                attempts: next.retry_count,
            });
        }
        match config.retry_policy.decide(next.retry_count) {
            RetryAction::DeadLetter { attempts } => {
                channel.basic_reject(delivery_tag, false).await?;
                log::warn!(
                    "Message sent to '{}' after {} attempts. Last error: {}",
                    descriptor.dead_letter_name,
                    attempts,
                    error
                );
                Ok(DeliveryOutcome::DeadLettered { attempts })
            }
            RetryAction::Retry { attempt } => {
                let properties = next.apply(&delivery.properties);
                channel
                    .basic_publish(DEFAULT_EXCHANGE, &descriptor.name, &delivery.data, &properties)
                    .await?;
                channel.basic_ack(delivery_tag).await?;
                log::warn!(
                    "Message republished to queue '{}' (attempt {}).",
                    descriptor.name,
                    attempt
                );
                Ok(DeliveryOutcome::Retried { attempt })
            }
        }
    }

    async fn process_once<H>(
        channel: &dyn BrokerChannel,
        config: &ConsumerConfig,
        handler: &H,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome, QueueError>
    where
        H: MessageHandler,
    {
        let delivery_tag = delivery.delivery_tag;
        let envelope = RetryEnvelope::from_properties(&delivery.properties);

        match invoke(handler, &delivery.data, &envelope, config.handler_timeout).await {
            Ok(()) if config.auto_ack => Ok(DeliveryOutcome::Acked),
            Ok(()) => {
                channel.basic_ack(delivery_tag).await?;
                log::info!("Message processed successfully. Tag: {}", delivery_tag);
                Ok(DeliveryOutcome::Acked)
            }
            Err(e) => {
                log::error!(
                    "Failed to process message from queue '{}' with '{}'. Tag: {}, Error: {}",
                    config.queue_name,
                    handler.handler_name(),
                    delivery_tag,
                    e
                );
                if config.auto_ack {
                    return Ok(DeliveryOutcome::Dropped);
                }
                if !e.is_retryable() {
                    channel.basic_reject(delivery_tag, false).await?;
                    return Ok(DeliveryOutcome::DeadLettered { attempts: 1 });
                }
                channel.basic_nack(delivery_tag, true).await?;
                Ok(DeliveryOutcome::Requeued)
            }
        }
    }

    async fn close_channel(channel: &dyn BrokerChannel, queue_name: &str) {
        if let Err(e) = channel.close().await {
            log::warn!("Failed to close consumer channel for queue '{}': {}", queue_name, e);
        }
    }
}

/// Decodes the body and runs the handler, bounded by `timeout` when set.
async fn invoke<H>(
    handler: &H,
    data: &[u8],
    envelope: &RetryEnvelope,
    timeout: Option<Duration>,
) -> Result<(), HandlerError>
where
    H: MessageHandler,
{
    let message: H::MessageType = serde_json::from_slice(data).map_err(HandlerError::Decode)?;
    let handling = handler.handle_message(message, envelope);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, handling)
            .await
            .map_err(|_| HandlerError::Timeout(limit))?,
        None => handling.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_builder_defaults() {
        let config = ConsumerConfig::builder("test_queue").build();

        assert_eq!(config.queue_name, "test_queue");
        assert_eq!(config.consumer_tag, "test_queue_consumer");
        assert_eq!(config.prefetch_count, 1);
        assert!(config.durable);
        assert!(!config.auto_ack);
        assert_eq!(config.retry_policy.max_retries, 3);
        assert_eq!(config.handler_timeout, None);
    }

    #[test]
    fn test_consumer_config_builder_custom_values() {
        let config = ConsumerConfig::builder("test_queue")
            .consumer_tag("custom_consumer")
            .prefetch_count(10)
            .durable(false)
            .auto_ack(true)
            .max_retries(5)
            .handler_timeout(Duration::from_secs(2))
            .build();

        assert_eq!(config.consumer_tag, "custom_consumer");
        assert_eq!(config.prefetch_count, 10);
        assert!(!config.durable);
        assert!(config.auto_ack);
        assert_eq!(config.retry_policy.max_retries, 5);
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(2)));
    }
}
