//! In-process broker for tests and local development.
//!
//! Follows the AMQP rules the pipeline depends on: default-exchange routing, queue
//! redeclare equivalence, explicit acknowledgment, requeue to the head of the queue,
//! dead-lettering through `x-dead-letter-exchange=""` and requeue of unacknowledged
//! deliveries when their channel closes. Nothing is durable; all state is lost when
//! the broker is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};

use super::{
    BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, HeaderValue,
    MessageProperties, QueueArguments, DEFAULT_EXCHANGE,
};
use crate::config::BrokerSettings;
use crate::error::QueueError;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, QueueError>>;

struct Subscriber {
    channel_id: u64,
    auto_ack: bool,
    sender: DeliverySender,
}

struct QueueState {
    durable: bool,
    arguments: QueueArguments,
    messages: VecDeque<StoredMessage>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    channel_owner: HashMap<u64, u64>,
    prefetch: HashMap<u64, u16>,
    next_delivery_tag: u64,
    next_channel_id: u64,
    next_connection_id: u64,
}

impl BrokerState {
    /// Whether a channel may take another unacknowledged delivery under its prefetch limit.
    fn has_capacity(&self, channel_id: u64) -> bool {
        match self.prefetch.get(&channel_id) {
            Some(&limit) if limit > 0 => {
                self.unacked
                    .values()
                    .filter(|entry| entry.channel_id == channel_id)
                    .count()
                    < usize::from(limit)
            }
            _ => true,
        }
    }

    /// Hands ready messages of `queue` to subscribers with spare prefetch capacity, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.messages.is_empty() {
                return;
            }
            let count = queue.subscribers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.next_subscriber + offset) % count)
                .find(|&i| {
                    let subscriber = &queue.subscribers[i];
                    subscriber.auto_ack || self.has_capacity(subscriber.channel_id)
                })
            else {
                return;
            };

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.next_subscriber = index + 1;

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let subscriber = &queue.subscribers[index];
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: queue_name.to_string(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };

            if subscriber.sender.send(Ok(delivery)).is_err() {
                // consumer went away without closing its channel
                queue.subscribers.remove(index);
                queue.messages.push_front(message);
                continue;
            }

            if !subscriber.auto_ack {
                let channel_id = subscriber.channel_id;
                self.unacked.insert(
                    tag,
                    Unacked {
                        channel_id,
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn settle(&mut self, channel_id: u64, tag: u64) -> Result<Unacked, QueueError> {
        match self.unacked.remove(&tag) {
            Some(entry) if entry.channel_id == channel_id => Ok(entry),
            other => {
                if let Some(entry) = other {
                    self.unacked.insert(tag, entry);
                }
                Err(QueueError::broker(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    tag
                )))
            }
        }
    }

    fn requeue(&mut self, entry: Unacked) {
        let Unacked { queue, mut message, .. } = entry;
        message.redelivered = true;
        if let Some(state) = self.queues.get_mut(&queue) {
            state.messages.push_front(message);
        }
        self.dispatch(&queue);
    }

    fn dead_letter(&mut self, entry: Unacked) {
        let Unacked { queue, mut message, .. } = entry;
        let Some(arguments) = self.queues.get(&queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let (Some(exchange), Some(routing_key)) =
            (arguments.dead_letter_exchange, arguments.dead_letter_routing_key)
        else {
            log::debug!("Rejected message from '{}' dropped, queue has no dead-letter route", queue);
            return;
        };
        if exchange != DEFAULT_EXCHANGE {
            log::warn!(
                "Rejected message from '{}' dropped, dead-letter exchange '{}' is not supported",
                queue,
                exchange
            );
            return;
        }

        message.redelivered = false;
        message
            .properties
            .headers
            .entry("x-first-death-queue".to_string())
            .or_insert(HeaderValue::Str(queue.clone()));
        message
            .properties
            .headers
            .entry("x-first-death-reason".to_string())
            .or_insert(HeaderValue::Str("rejected".to_string()));

        match self.queues.get_mut(&routing_key) {
            Some(target) => {
                target.messages.push_back(message);
                self.dispatch(&routing_key);
            }
            None => log::warn!(
                "Dead-letter queue '{}' for '{}' does not exist, message dropped",
                routing_key,
                queue
            ),
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        self.channel_owner.remove(&channel_id);
        self.prefetch.remove(&channel_id);
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.channel_id != channel_id);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // highest tag first so that push_front restores delivery order
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.requeue(entry);
            }
        }
    }
}

/// In-memory broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connections_opened: Arc<AtomicUsize>,
    unreachable: Arc<AtomicBool>,
    nack_publishes: Arc<AtomicBool>,
    open_connections: Arc<Mutex<Vec<Arc<MemoryConnection>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
    }

    /// Makes new connection attempts fail as if the broker were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes every following publish come back negatively confirmed.
    pub fn nack_publishes(&self, nack: bool) {
        self.nack_publishes.store(nack, Ordering::SeqCst);
    }

    /// Closes every open connection from the broker side.
    pub async fn close_connections(&self) {
        let connections: Vec<_> = self.open_connections.lock().await.drain(..).collect();
        for connection in connections {
            connection.shutdown().await;
        }
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }

    pub async fn queue_durable(&self, queue: &str) -> Option<bool> {
        self.state.lock().await.queues.get(queue).map(|q| q.durable)
    }

    pub async fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    /// Ready (not yet delivered) messages in a queue.
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Copies of the ready messages in a queue, head first.
    pub async fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels opened and not yet closed, across all connections.
    pub async fn open_channels(&self) -> usize {
        self.state.lock().await.channel_owner.len()
    }

    /// Delivered but not yet settled messages across all queues.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.subscribers.len())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _settings: &BrokerSettings) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(QueueError::connectivity("connection refused (memory broker unreachable)"));
        }
        let id = {
            let mut state = self.state.lock().await;
            state.next_connection_id += 1;
            state.next_connection_id
        };
        let connection = Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
        });
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.open_connections.lock().await.push(connection.clone());
        Ok(connection)
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    async fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.broker.state.lock().await;
        let channels: Vec<u64> = state
            .channel_owner
            .iter()
            .filter(|(_, owner)| **owner == self.id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            state.close_channel(channel);
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        if !self.is_open() {
            return Err(QueueError::connectivity("connection is closed"));
        }
        let id = {
            let mut state = self.broker.state.lock().await;
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channel_owner.insert(id, self.id);
            id
        };
        Ok(Box::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.shutdown().await;
        self.broker
            .open_connections
            .lock()
            .await
            .retain(|c| c.id != self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(QueueError::connectivity("connection is closed"));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(QueueError::connectivity(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }

    async fn settle(&self, tag: u64, requeue: bool) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        let entry = state.settle(self.id, tag)?;
        if requeue {
            state.requeue(entry);
        } else {
            let queue = entry.queue.clone();
            state.dead_letter(entry);
            state.dispatch(&queue);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        match state.queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(QueueError::broker(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                queue
            ))),
            Some(existing) if existing.arguments != *arguments => Err(QueueError::broker(format!(
                "PRECONDITION_FAILED - inequivalent dead-letter arguments for queue '{}'",
                queue
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.to_string(),
                    QueueState {
                        durable,
                        arguments: arguments.clone(),
                        messages: VecDeque::new(),
                        subscribers: Vec::new(),
                        next_subscriber: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.broker.state.lock().await.prefetch.insert(self.id, prefetch_count);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), QueueError> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        if exchange != DEFAULT_EXCHANGE {
            return Err(QueueError::broker(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if self.broker.nack_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::broker(format!(
                "message to '{}' was negatively confirmed",
                routing_key
            )));
        }

        let mut state = self.broker.state.lock().await;
        match state.queues.get_mut(routing_key) {
            Some(queue) => {
                queue.messages.push_back(StoredMessage {
                    data: body.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                });
                state.dispatch(routing_key);
            }
            None => log::debug!("Unroutable message for '{}' dropped", routing_key),
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, QueueError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.broker.state.lock().await;
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(QueueError::broker(format!("NOT_FOUND - no queue '{}'", queue)));
        };
        target.subscribers.push(Subscriber {
            channel_id: self.id,
            auto_ack,
            sender,
        });
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        let entry = state.settle(self.id, delivery_tag)?;
        state.dispatch(&entry.queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        self.settle(delivery_tag, requeue).await
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError> {
        self.settle(delivery_tag, requeue).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.state.lock().await.close_channel(self.id);
        Ok(())
    }
}
