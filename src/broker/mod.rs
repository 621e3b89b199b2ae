//! Broker client seam.
//!
//! The pipeline talks to the message broker only through the object-safe traits in
//! this module. [`amqp`] backs them with `lapin` (AMQP 0-9-1 / RabbitMQ) and
//! [`memory`] with an in-process broker that follows the same routing, acknowledgment
//! and dead-lettering rules, which keeps the retry state machine testable without a
//! running RabbitMQ.
//!
//! Operations mirror AMQP methods: queues live on the default exchange (`""`), where
//! the routing key is the queue name, and deliveries are settled on the channel that
//! received them by delivery tag.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::BrokerSettings;
use crate::error::QueueError;

/// The default (nameless) exchange; routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Stream of deliveries for one subscription, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// A message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }
}

/// Application headers, ordered by key.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Message properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Delivery mode 2 (survives a broker restart on a durable queue).
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
    pub headers: Headers,
}

impl MessageProperties {
    /// Properties for a fresh publish: new message id, current timestamp, no headers.
    pub fn for_publish(persistent: bool) -> Self {
        Self {
            persistent,
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: Some(unix_now()),
            headers: Headers::new(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }
}

pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Dead-letter routing arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

/// Opens physical connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &BrokerSettings) -> Result<Arc<dyn BrokerConnection>, QueueError>;
}

/// One physical broker connection; channels multiplex over it.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// A logical session on a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue. Redeclaring with the same durability and arguments is a no-op,
    /// anything else is refused by the broker.
    async fn queue_declare(
        &self,
        queue: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> Result<(), QueueError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), QueueError>;

    /// Enables publisher confirms; `basic_publish` then returns once the broker took the message.
    async fn confirm_select(&self) -> Result<(), QueueError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), QueueError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, QueueError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), QueueError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}
