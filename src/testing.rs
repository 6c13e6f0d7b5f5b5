// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits, for behavioural tests.

use crate::{
    errors::TransportError,
    queue::QueueInfo,
    transport::{Acknowledger, AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

type Feed = UnboundedSender<Result<Delivery, TransportError>>;

#[derive(Default)]
pub(crate) struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    consumers: HashMap<String, (String, Feed)>,
    generation: u64,
    next_tag: u64,
    pub(crate) refuse_dial: bool,
    pub(crate) dials: usize,
    pub(crate) channels_opened: usize,
    pub(crate) declares: usize,
    pub(crate) cancels: Vec<String>,
    pub(crate) acked: Vec<u64>,
    pub(crate) rejected: Vec<u64>,
    pub(crate) published: Vec<(String, BasicProperties)>,
}

/// A broker living in process memory. Clones share the same state.
#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub(crate) fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// Simulates a network failure: every connection and channel dies.
    pub(crate) fn drop_connections(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.consumers.clear();
    }

    /// Simulates the broker cancelling every consumer.
    pub(crate) fn drop_consumers(&self) {
        self.state().consumers.clear();
    }

    /// Puts a raw delivery on a queue, bypassing publish.
    pub(crate) fn push_raw(&self, queue: &str, data: &[u8]) {
        let mut state = self.state();
        state.next_tag += 1;
        let delivery = Delivery::new(state.next_tag, queue, data.to_vec()).with_acker(Arc::new(
            MemoryAcker {
                broker: self.clone(),
                tag: state.next_tag,
            },
        ));
        route(&mut state, queue, delivery);
    }

    pub(crate) fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }
}

fn route(state: &mut BrokerState, queue: &str, delivery: Delivery) {
    let feed = state
        .consumers
        .values()
        .find(|(consumed, _)| consumed == queue)
        .map(|(_, feed)| feed.clone());

    match feed {
        Some(feed) if feed.send(Ok(delivery.clone())).is_ok() => {}
        _ => state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(delivery),
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn dial(&self, _url: &str) -> Result<Box<dyn AmqpConnection>, TransportError> {
        let mut state = self.state();
        if state.refuse_dial {
            return Err(TransportError::Protocol("connection refused".to_owned()));
        }
        state.dials += 1;

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            generation: state.generation,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    generation: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_closed(&self) -> bool {
        self.broker.state().generation != self.generation
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed("connection is closed".to_owned()));
        }
        self.broker.state().channels_opened += 1;

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            generation: self.generation,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed("connection is closed".to_owned()));
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.broker.state().generation == self.generation
    }

    async fn qos(&self, _prefetch_count: u16, _global: bool) -> Result<(), TransportError> {
        self.check_open()
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.declares += 1;

        if options.passive && !state.queues.contains_key(name) {
            return Err(TransportError::NotFound(format!("no queue '{}'", name)));
        }
        let consumers = state
            .consumers
            .values()
            .filter(|(queue, _)| queue == name)
            .count() as u32;
        let messages = state.queues.entry(name.to_owned()).or_default().len() as u32;

        Ok(QueueInfo::new(name, messages, consumers))
    }

    async fn queue_delete(
        &self,
        name: &str,
        _options: QueueDeleteOptions,
    ) -> Result<u32, TransportError> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.consumers.retain(|_, (queue, _)| queue != name);

        Ok(state
            .queues
            .remove(name)
            .map(|queue| queue.len() as u32)
            .unwrap_or_default())
    }

    async fn basic_publish(
        &self,
        _exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.next_tag += 1;
        state
            .published
            .push((routing_key.to_owned(), properties.clone()));

        let delivery = Delivery::new(state.next_tag, routing_key, payload.to_vec())
            .with_properties(properties)
            .with_acker(Arc::new(MemoryAcker {
                broker: self.broker.clone(),
                tag: state.next_tag,
            }));
        route(&mut state, routing_key, delivery);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.check_open()?;
        let mut state = self.broker.state();

        let Some(pending) = state.queues.get_mut(queue) else {
            // the broker closes the channel on a 404
            self.closed.store(true, Ordering::SeqCst);
            return Err(TransportError::NotFound(format!("no queue '{}'", queue)));
        };
        let backlog: Vec<Delivery> = pending.drain(..).collect();

        let (feed, mut rx) = unbounded_channel();
        for delivery in backlog {
            let _ = feed.send(Ok(delivery));
        }
        state
            .consumers
            .insert(consumer_tag.to_owned(), (queue.to_owned(), feed));

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        _options: BasicCancelOptions,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.broker.state();
        state.cancels.push(consumer_tag.to_owned());
        state.consumers.remove(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.broker.state().acked.push(self.tag);
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), TransportError> {
        self.broker.state().rejected.push(self.tag);
        Ok(())
    }
}

/// Routes crate logs to the test output; `RUST_LOG` picks the level.
pub(crate) fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
