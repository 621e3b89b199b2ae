//! RabbitMQ backend over `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Connection, ConnectionProperties,
};

use super::{
    BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, HeaderValue, Headers,
    MessageProperties, QueueArguments,
};
use crate::config::BrokerSettings;
use crate::error::QueueError;

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections from [`BrokerSettings`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, settings: &BrokerSettings) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(settings.client_provided_name.clone().into());
        let connection = Connection::connect_uri(amqp_uri(settings), properties).await?;
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

/// Builds the connection URI field by field so credentials and vhost need no escaping.
pub fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.username.clone(),
                password: settings.password.clone(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(settings.heartbeat),
            connection_timeout: Some(settings.connection_timeout),
            ..Default::default()
        },
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable, ..Default::default() },
                queue_arguments(arguments),
            )
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), QueueError> {
        self.channel.basic_qos(prefetch_count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), QueueError> {
        self.channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), QueueError> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::broker(format!(
                "publish to '{}' was not confirmed by the broker",
                routing_key
            )));
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions { no_ack: auto_ack, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(from_lapin_delivery).map_err(QueueError::from))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await?;
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.clone().into()),
        );
    }
    table
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let delivery_mode = if properties.persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };
    let mut basic = BasicProperties::default().with_delivery_mode(delivery_mode);

    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(ShortString::from(key.clone()), to_amqp_value(value));
        }
        basic = basic.with_headers(table);
    }
    basic
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Str(s) => AMQPValue::LongString(s.clone().into()),
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
    }
}

/// Maps an AMQP field value onto a header value. Tables, arrays and other
/// structured values (such as `x-death`) have no counterpart and are skipped.
fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Str(s.as_str().to_owned())),
        AMQPValue::LongString(s) => Some(HeaderValue::Str(s.to_string())),
        _ => None,
    }
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    let mut headers = Headers::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let Some(value) = from_amqp_value(value) {
                headers.insert(key.as_str().to_owned(), value);
            }
        }
    }

    MessageProperties {
        persistent: *properties.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        message_id: properties.message_id().as_ref().map(|id| id.as_str().to_owned()),
        timestamp: *properties.timestamp(),
        headers,
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        data: delivery.data,
    }
}
