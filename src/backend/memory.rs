// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living in the current process. It keeps the AMQP semantics the
//! topology and the retry path depend on:
//!
//! - direct, fanout and topic routing, exchange-to-exchange bindings
//! - `x-delayed-message` exchanges honouring the `x-delay` header
//! - queue message TTL, max length and dead-lettering
//! - prefetch, ack, nack, publisher confirms and transactions
//! - declaration conflicts reported as `PRECONDITION_FAILED`, closing the channel
//!
//! Consumers receive deliveries through an unbounded tokio channel. State is
//! shared behind a mutex that is never held across an `.await`. Timers need a
//! running tokio runtime.

use crate::{
    config::AmqpConfig,
    connection::{Backend, BackendKind, Channel, Connection, Delivery, DeliveryStream},
    envelope::AMQP_HEADERS_DELAY,
    errors::{AmqpError, ConnectionError},
    exchange::{ExchangeBinding, ExchangeDefinition, ExchangeKind, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{types::AMQPValue, BasicProperties};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

type ChannelKey = (u64, u16);

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Declared entities, for inspection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    pub exchanges: BTreeMap<String, ExchangeDefinition>,
    pub queues: BTreeMap<String, QueueDefinition>,
    pub exchange_bindings: Vec<ExchangeBinding>,
    pub queue_bindings: Vec<QueueBinding>,
}

#[derive(Debug, Clone)]
struct Stored {
    id: u64,
    msg: QueuedMessage,
}

struct ConsumerSlot {
    tag: String,
    channel: ChannelKey,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct Unacked {
    queue: String,
    stored: Stored,
}

struct Pending {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    confirm: bool,
    tx: Option<Vec<Pending>>,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Default)]
struct ConnectionState {
    next_channel: u16,
}

#[derive(Default)]
struct BrokerState {
    stopped: bool,
    credentials: Vec<(String, String)>,
    next_id: u64,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<ChannelKey, ChannelState>,
    exchanges: BTreeMap<String, ExchangeDefinition>,
    queues: BTreeMap<String, QueueState>,
    exchange_bindings: Vec<ExchangeBinding>,
    queue_bindings: Vec<QueueBinding>,
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    /// Only these user/password pairs may connect.
    pub fn with_credentials(self, credentials: &[(&str, &str)]) -> Self {
        self.state().credentials = credentials
            .iter()
            .map(|(u, p)| ((*u).to_owned(), (*p).to_owned()))
            .collect();
        self
    }

    /// Drops every connection and refuses new ones.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.stopped = true;
        state.connections.clear();
        let keys: Vec<ChannelKey> = state.channels.keys().copied().collect();
        for key in keys {
            close_channel(&mut state, key);
        }
        debug!("memory broker stopped");
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let state = self.state();
        TopologySnapshot {
            exchanges: state.exchanges.clone(),
            queues: state
                .queues
                .iter()
                .map(|(name, q)| (name.clone(), q.def.clone()))
                .collect(),
            exchange_bindings: state.exchange_bindings.clone(),
            queue_bindings: state.queue_bindings.clone(),
        }
    }

    /// Ready messages of `queue`, in delivery order.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.msg.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.ready.len())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_running(&self, conn: u64) -> bool {
        let state = self.state();
        !state.stopped && state.connections.contains_key(&conn)
    }

    /// Publishes, holding the message first when the exchange is delayed.
    fn publish(&self, pending: Pending) -> Result<(), String> {
        let delay = {
            let state = self.state();
            match state.exchanges.get(&pending.exchange) {
                Some(exchange) if exchange.kind == ExchangeKind::XMessageDelayed => {
                    header_delay(&pending.properties)
                }
                Some(_) => 0,
                None if pending.exchange.is_empty() => 0,
                None => {
                    return Err(format!(
                        "NOT_FOUND - no exchange '{}' in vhost",
                        pending.exchange
                    ))
                }
            }
        };

        if delay == 0 {
            self.route_now(pending);
            return Ok(());
        }

        debug!(exchange = pending.exchange, delay, "holding delayed message");
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            broker.route_now(pending);
        });

        Ok(())
    }

    /// False when `pending` would be dropped as unroutable right now.
    fn routable_now(&self, pending: &Pending) -> bool {
        let state = self.state();
        match state.exchanges.get(&pending.exchange) {
            Some(exchange) if exchange.kind == ExchangeKind::XMessageDelayed => true,
            None if !pending.exchange.is_empty() => true,
            _ => !route(&state, &pending.exchange, &pending.routing_key).is_empty(),
        }
    }

    fn route_now(&self, pending: Pending) {
        let mut state = self.state();
        if state.stopped {
            return;
        }

        let targets = route(&state, &pending.exchange, &pending.routing_key);
        if targets.is_empty() {
            debug!(
                exchange = pending.exchange,
                key = pending.routing_key,
                "message is unroutable, dropped"
            );
            return;
        }

        let msg = QueuedMessage {
            exchange: pending.exchange,
            routing_key: pending.routing_key,
            redelivered: false,
            properties: pending.properties,
            data: pending.data,
        };

        let mut expiring = vec![];
        for queue in targets {
            if let Some(expiry) = enqueue(&mut state, &queue, msg.clone()) {
                expiring.push(expiry);
            }
        }
        drop(state);

        for (queue, id, ttl) in expiring {
            self.schedule_expiry(queue, id, ttl);
        }
    }

    fn schedule_expiry(&self, queue: String, id: u64, ttl: u32) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl as u64)).await;
            broker.expire(&queue, id);
        });
    }

    fn expire(&self, queue: &str, id: u64) {
        let mut state = self.state();
        if state.stopped {
            return;
        }

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = q.ready.iter().position(|s| s.id == id) else {
            return;
        };
        let Some(stored) = q.ready.remove(pos) else {
            return;
        };
        let def = q.def.clone();
        drop(state);

        debug!(queue, "message expired");
        self.dead_letter(&def, stored.msg);
    }

    fn dead_letter(&self, def: &QueueDefinition, msg: QueuedMessage) {
        let Some(exchange) = def.dead_letter_exchange.clone() else {
            debug!(queue = def.name, "message dropped, no dead letter exchange");
            return;
        };

        let routing_key = def
            .dead_letter_routing_key
            .clone()
            .unwrap_or(msg.routing_key);

        self.route_now(Pending {
            exchange,
            routing_key,
            properties: msg.properties,
            data: msg.data,
        });
    }

    /// Removes `tag` from the channel's unacked set.
    fn settle(&self, key: ChannelKey, tag: u64) -> Result<Unacked, String> {
        let mut state = self.state();
        let unacked = state
            .channels
            .get_mut(&key)
            .and_then(|ch| ch.unacked.remove(&tag));

        match unacked {
            Some(u) => Ok(u),
            None => {
                close_channel(&mut state, key);
                Err(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
            }
        }
    }

    fn redispatch(&self, queue: &str) {
        let mut state = self.state();
        dispatch(&mut state, queue);
    }

    fn channel_error(&self, key: ChannelKey) {
        close_channel(&mut self.state(), key);
    }
}

#[async_trait]
impl Backend for MemoryBroker {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn supported_options(&self) -> &'static [&'static str] {
        &[]
    }

    async fn open(&self, cfg: &AmqpConfig) -> Result<Box<dyn Connection>, ConnectionError> {
        let mut state = self.state();
        if state.stopped {
            return Err(ConnectionError::Connect("connection refused".to_owned()));
        }

        if !state.credentials.is_empty()
            && !state
                .credentials
                .iter()
                .any(|(u, p)| *u == cfg.user && *p == cfg.password)
        {
            warn!(user = cfg.user, "login refused");
            return Err(ConnectionError::Connect(format!(
                "ACCESS_REFUSED - login was refused using authentication mechanism PLAIN for user '{}'",
                cfg.user
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(id, ConnectionState::default());

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            cfg: cfg.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    cfg: AmqpConfig,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn config(&self) -> &AmqpConfig {
        &self.cfg
    }

    fn is_connected(&self) -> bool {
        self.broker.is_running(self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, ConnectionError> {
        let mut state = self.broker.state();
        if state.stopped {
            return Err(ConnectionError::Channel("connection closed".to_owned()));
        }

        let Some(conn) = state.connections.get_mut(&self.id) else {
            return Err(ConnectionError::Channel("connection closed".to_owned()));
        };
        conn.next_channel = conn.next_channel.wrapping_add(1).max(1);
        let key = (self.id, conn.next_channel);
        state.channels.insert(key, ChannelState::default());

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            key,
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.broker.state();
        state.connections.remove(&self.id);

        let keys: Vec<ChannelKey> = state
            .channels
            .keys()
            .filter(|(conn, _)| *conn == self.id)
            .copied()
            .collect();
        for key in keys {
            close_channel(&mut state, key);
        }

        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    key: ChannelKey,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed)
        }
    }

    /// Broker side errors close the channel, like a channel.close from the server.
    fn fail(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.broker.channel_error(self.key);
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let pending = Pending {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: body.to_vec(),
        };

        let pending = {
            let mut state = self.broker.state();
            let exists = exchange.is_empty() || state.exchanges.contains_key(exchange);
            let ch = state
                .channels
                .get_mut(&self.key)
                .ok_or(AmqpError::ChannelClosed)?;

            match ch.tx.as_mut() {
                Some(buffer) if exists => {
                    buffer.push(pending);
                    return Ok(());
                }
                _ => pending,
            }
        };

        // delayed exchanges route later, so only immediate routes are checked
        if mandatory && !self.broker.routable_now(&pending) {
            debug!(exchange, routing_key, "mandatory publish returned");
            return Err(AmqpError::Unroutable(
                exchange.to_owned(),
                routing_key.to_owned(),
            ));
        }

        self.broker.publish(pending).map_err(|reason| {
            self.fail();
            AmqpError::PublishingError(reason)
        })
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    fn is_open(&self) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }

        let state = self.broker.state();
        !state.stopped
            && state.connections.contains_key(&self.key.0)
            && state.channels.contains_key(&self.key)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let ch = state
            .channels
            .get_mut(&self.key)
            .ok_or(AmqpError::ChannelClosed)?;
        ch.prefetch = prefetch_count;
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let outcome = {
            let mut state = self.broker.state();
            match state.exchanges.get(&def.name) {
                Some(existing) if !exchange_equivalent(existing, def) => Err(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    def.name
                )),
                Some(_) => Ok(()),
                None if def.passive => {
                    Err(format!("NOT_FOUND - no exchange '{}' in vhost", def.name))
                }
                None => {
                    state.exchanges.insert(def.name.clone(), def.clone());
                    Ok(())
                }
            }
        };

        outcome.map_err(|reason| {
            self.fail();
            AmqpError::DeclareExchangeError(def.name.clone(), reason)
        })
    }

    async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let outcome = {
            let mut state = self.broker.state();
            match [&binding.destination, &binding.source]
                .into_iter()
                .find(|name| !state.exchanges.contains_key(*name))
            {
                Some(missing) => Err(format!("NOT_FOUND - no exchange '{missing}' in vhost")),
                None => {
                    if !state.exchange_bindings.contains(binding) {
                        state.exchange_bindings.push(binding.clone());
                    }
                    Ok(())
                }
            }
        };

        outcome.map_err(|reason| {
            self.fail();
            AmqpError::BindingExchangeToExchangeError(
                binding.destination.clone(),
                binding.source.clone(),
                reason,
            )
        })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let outcome = {
            let mut state = self.broker.state();
            match state.queues.get(&def.name) {
                Some(existing) if !queue_equivalent(&existing.def, def) => Err(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    def.name
                )),
                Some(_) => Ok(()),
                None if def.passive => Err(format!("NOT_FOUND - no queue '{}' in vhost", def.name)),
                None => {
                    state.queues.insert(
                        def.name.clone(),
                        QueueState {
                            def: def.clone(),
                            ..QueueState::default()
                        },
                    );
                    Ok(())
                }
            }
        };

        outcome.map_err(|reason| {
            self.fail();
            AmqpError::DeclareQueueError(def.name.clone(), reason)
        })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let outcome = {
            let mut state = self.broker.state();
            if !state.queues.contains_key(&binding.queue_name) {
                Err(format!(
                    "NOT_FOUND - no queue '{}' in vhost",
                    binding.queue_name
                ))
            } else if !state.exchanges.contains_key(&binding.exchange_name) {
                Err(format!(
                    "NOT_FOUND - no exchange '{}' in vhost",
                    binding.exchange_name
                ))
            } else {
                if !state.queue_bindings.contains(binding) {
                    state.queue_bindings.push(binding.clone());
                }
                Ok(())
            }
        };

        outcome.map_err(|reason| {
            self.fail();
            AmqpError::BindingExchangeToQueueError(
                binding.queue_name.clone(),
                binding.exchange_name.clone(),
                reason,
            )
        })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let outcome = {
            let mut state = self.broker.state();
            let ch = state
                .channels
                .get_mut(&self.key)
                .ok_or(AmqpError::ChannelClosed)?;
            if ch.tx.is_some() {
                Err("PRECONDITION_FAILED - cannot switch from tx to confirm mode".to_owned())
            } else {
                ch.confirm = true;
                Ok(())
            }
        };

        outcome.map_err(|reason| {
            self.fail();
            AmqpError::ConfirmSelectError(reason)
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.publish(exchange, routing_key, body, properties, false)
    }

    async fn basic_publish_mandatory(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.publish(exchange, routing_key, body, properties, true)
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let outcome = {
            let mut state = self.broker.state();
            let ch = state
                .channels
                .get_mut(&self.key)
                .ok_or(AmqpError::ChannelClosed)?;
            if ch.confirm {
                Err("PRECONDITION_FAILED - cannot switch from confirm to tx mode".to_owned())
            } else {
                if ch.tx.is_none() {
                    ch.tx = Some(vec![]);
                }
                Ok(())
            }
        };

        outcome.map_err(|reason| {
            self.fail();
            AmqpError::TransactionError(reason)
        })
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let buffered = {
            let mut state = self.broker.state();
            let ch = state
                .channels
                .get_mut(&self.key)
                .ok_or(AmqpError::ChannelClosed)?;
            ch.tx.as_mut().map(std::mem::take)
        };

        let Some(buffered) = buffered else {
            self.fail();
            return Err(AmqpError::TransactionError(
                "PRECONDITION_FAILED - channel is not transactional".to_owned(),
            ));
        };

        for pending in buffered {
            if let Err(reason) = self.broker.publish(pending) {
                self.fail();
                return Err(AmqpError::TransactionError(reason));
            }
        }

        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let rolled_back = {
            let mut state = self.broker.state();
            let ch = state
                .channels
                .get_mut(&self.key)
                .ok_or(AmqpError::ChannelClosed)?;
            ch.tx.as_mut().map(Vec::clear).is_some()
        };

        if !rolled_back {
            self.fail();
            return Err(AmqpError::TransactionError(
                "PRECONDITION_FAILED - channel is not transactional".to_owned(),
            ));
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        let (sender, receiver) = mpsc::unbounded_channel();

        let outcome = {
            let mut state = self.broker.state();
            let key = self.key;
            match state.queues.get_mut(queue) {
                None => Err(format!("NOT_FOUND - no queue '{queue}' in vhost")),
                Some(q) if q.consumers.iter().any(|c| c.tag == tag && c.channel == key) => {
                    Err(format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"))
                }
                Some(q) => {
                    q.consumers.push(ConsumerSlot {
                        tag: tag.clone(),
                        channel: key,
                        sender,
                    });
                    dispatch(&mut state, queue);
                    Ok(())
                }
            }
        };

        if let Err(reason) = outcome {
            self.fail();
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned(), reason));
        }

        debug!(queue, tag, "consumer registered");

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let unacked = self.broker.settle(self.key, delivery_tag).map_err(|reason| {
            self.open.store(false, Ordering::SeqCst);
            AmqpError::AckMessageError(reason)
        })?;

        self.broker.redispatch(&unacked.queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let unacked = self.broker.settle(self.key, delivery_tag).map_err(|reason| {
            self.open.store(false, Ordering::SeqCst);
            AmqpError::NackMessageError(reason)
        })?;

        if requeue {
            let mut state = self.broker.state();
            requeue_front(&mut state, unacked);
            return Ok(());
        }

        let def = self
            .broker
            .state()
            .queues
            .get(&unacked.queue)
            .map(|q| q.def.clone());
        if let Some(def) = def {
            self.broker.dead_letter(&def, unacked.stored.msg);
        }
        self.broker.redispatch(&unacked.queue);

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        close_channel(&mut self.broker.state(), self.key);
        Ok(())
    }
}

/// Closes a channel: its consumers go away and its unacked messages are
/// requeued with the redelivered flag.
fn close_channel(state: &mut BrokerState, key: ChannelKey) {
    let Some(ch) = state.channels.remove(&key) else {
        return;
    };

    let mut touched = BTreeSet::new();
    for q in state.queues.values_mut() {
        q.consumers.retain(|c| c.channel != key);
    }

    for (_, unacked) in ch.unacked.into_iter().rev() {
        touched.insert(unacked.queue.clone());
        requeue_front(state, unacked);
    }

    for queue in touched {
        dispatch(state, &queue);
    }
}

fn requeue_front(state: &mut BrokerState, unacked: Unacked) {
    if let Some(q) = state.queues.get_mut(&unacked.queue) {
        let mut stored = unacked.stored;
        stored.msg.redelivered = true;
        q.ready.push_front(stored);
        dispatch(state, &unacked.queue);
    }
}

/// Appends to a queue, enforcing its max length, then hands ready messages
/// to consumers. Returns what must be expired later.
fn enqueue(state: &mut BrokerState, queue: &str, msg: QueuedMessage) -> Option<(String, u64, u32)> {
    state.next_id += 1;
    let id = state.next_id;

    let q = state.queues.get_mut(queue)?;
    q.ready.push_back(Stored { id, msg });

    let mut overflow = vec![];
    if let Some(max) = q.def.max_length {
        while q.ready.len() > max as usize {
            if let Some(head) = q.ready.pop_front() {
                overflow.push(head);
            }
        }
    }
    let ttl = q.def.ttl;
    let def = q.def.clone();

    dispatch(state, queue);

    for dropped in overflow {
        warn!(queue, "queue is full, dropping head");
        if let Some(exchange) = def.dead_letter_exchange.as_deref() {
            let key = def
                .dead_letter_routing_key
                .clone()
                .unwrap_or_else(|| dropped.msg.routing_key.clone());
            for target in route(state, exchange, &key) {
                let mut msg = dropped.msg.clone();
                msg.exchange = exchange.to_owned();
                msg.routing_key = key.clone();
                enqueue(state, &target, msg);
            }
        }
    }

    let still_ready = state
        .queues
        .get(queue)
        .is_some_and(|q| q.ready.iter().any(|s| s.id == id));

    match ttl {
        Some(ttl) if still_ready => Some((queue.to_owned(), id, ttl)),
        _ => None,
    }
}

/// Delivers ready messages round robin to consumers with prefetch room.
fn dispatch(state: &mut BrokerState, queue: &str) {
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        q.consumers.retain(|c| !c.sender.is_closed());
        if q.ready.is_empty() || q.consumers.is_empty() {
            return;
        }

        let count = q.consumers.len();
        let mut chosen = None;
        for offset in 0..count {
            let idx = (q.cursor + offset) % count;
            let key = q.consumers[idx].channel;
            let has_room = state.channels.get(&key).is_some_and(|ch| {
                ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize
            });
            if has_room {
                chosen = Some(idx);
                break;
            }
        }

        let Some(idx) = chosen else {
            return;
        };

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        q.cursor = (idx + 1) % count;
        let Some(stored) = q.ready.pop_front() else {
            return;
        };
        let key = q.consumers[idx].channel;
        let sender = q.consumers[idx].sender.clone();

        let Some(ch) = state.channels.get_mut(&key) else {
            return;
        };
        ch.next_tag += 1;
        let tag = ch.next_tag;

        let delivery = Delivery {
            delivery_tag: tag,
            exchange: stored.msg.exchange.clone(),
            routing_key: stored.msg.routing_key.clone(),
            redelivered: stored.msg.redelivered,
            properties: stored.msg.properties.clone(),
            data: stored.msg.data.clone(),
        };

        ch.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_owned(),
                stored,
            },
        );

        if sender.send(delivery).is_err() {
            if let Some(unacked) = state
                .channels
                .get_mut(&key)
                .and_then(|ch| ch.unacked.remove(&tag))
            {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_front(unacked.stored);
                }
            }
        }
    }
}

/// Queues reached by a message published to `exchange` with `routing_key`.
fn route(state: &BrokerState, exchange: &str, routing_key: &str) -> BTreeSet<String> {
    let mut queues = BTreeSet::new();
    let mut visited = HashSet::new();
    route_into(state, exchange, routing_key, &mut visited, &mut queues);
    queues
}

fn route_into(
    state: &BrokerState,
    exchange: &str,
    routing_key: &str,
    visited: &mut HashSet<String>,
    queues: &mut BTreeSet<String>,
) {
    if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            queues.insert(routing_key.to_owned());
        }
        return;
    }

    if !visited.insert(exchange.to_owned()) {
        return;
    }

    let Some(def) = state.exchanges.get(exchange) else {
        return;
    };
    let kind = routing_kind(def);

    for binding in state
        .queue_bindings
        .iter()
        .filter(|b| b.exchange_name == exchange)
    {
        if key_matches(&kind, &binding.routing_key, routing_key) {
            queues.insert(binding.queue_name.clone());
        }
    }

    for binding in state
        .exchange_bindings
        .iter()
        .filter(|b| b.source == exchange)
    {
        if key_matches(&kind, &binding.routing_key, routing_key) {
            route_into(state, &binding.destination, routing_key, visited, queues);
        }
    }
}

/// Routing behaviour of an exchange; delayed exchanges route like their
/// wrapped type.
fn routing_kind(def: &ExchangeDefinition) -> ExchangeKind {
    if def.kind != ExchangeKind::XMessageDelayed {
        return def.kind.clone();
    }

    match def.params.get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE) {
        Some(AMQPValue::LongString(name)) => {
            ExchangeKind::from_name(&String::from_utf8_lossy(name.as_bytes()))
                .unwrap_or(ExchangeKind::Direct)
        }
        Some(AMQPValue::ShortString(name)) => {
            ExchangeKind::from_name(name.as_str()).unwrap_or(ExchangeKind::Direct)
        }
        _ => ExchangeKind::Direct,
    }
}

fn key_matches(kind: &ExchangeKind, pattern: &str, key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = key.split('.').collect();
            topic_matches(&pattern, &key)
        }
        // header matching is not emulated
        ExchangeKind::Headers => false,
        ExchangeKind::Direct | ExchangeKind::XMessageDelayed => pattern == key,
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && topic_matches(rest, key_rest)
        }
        _ => false,
    }
}

fn header_delay(props: &BasicProperties) -> u64 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    match headers.inner().get(AMQP_HEADERS_DELAY) {
        Some(AMQPValue::LongLongInt(v)) => (*v).max(0) as u64,
        Some(AMQPValue::LongInt(v)) => (*v).max(0) as u64,
        Some(AMQPValue::LongUInt(v)) => *v as u64,
        Some(AMQPValue::ShortInt(v)) => (*v).max(0) as u64,
        Some(AMQPValue::ShortUInt(v)) => *v as u64,
        _ => 0,
    }
}

fn exchange_equivalent(a: &ExchangeDefinition, b: &ExchangeDefinition) -> bool {
    if b.passive {
        return true;
    }

    a.kind == b.kind
        && a.durable == b.durable
        && a.delete == b.delete
        && a.internal == b.internal
        && a.params == b.params
}

fn queue_equivalent(a: &QueueDefinition, b: &QueueDefinition) -> bool {
    if b.passive {
        return true;
    }

    a.durable == b.durable
        && a.delete == b.delete
        && a.exclusive == b.exclusive
        && a.arguments() == b.arguments()
}
