// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Interfaces
//!
//! The messaging context never talks to `lapin` directly. It drives a
//! connection and a channel through the traits below, so a fake broker can
//! stand in for RabbitMQ in tests. The `lapin` implementations live in
//! [`crate::channel`].

use crate::{errors::AmqpError, errors::TransportError, otel, queue::QueueInfo};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use opentelemetry::Context;
use std::{fmt, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Ordered feed of deliveries pushed by the broker to one consumer.
///
/// The stream ending means the broker dropped the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Dials broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn AmqpConnection>, TransportError>;
}

/// One physical broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Whether the connection can no longer be used and must be redialed.
    fn is_closed(&self) -> bool;

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// The subset of AMQP channel methods the context relies on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), TransportError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError>;

    /// Deletes a queue, returning the number of messages it still held.
    async fn queue_delete(
        &self,
        name: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message pushed by the broker to a registered consumer.
///
/// Deliveries are consumed in manual acknowledgement mode: nothing settles
/// them unless the caller invokes [`Delivery::ack`], [`Delivery::nack`] or
/// [`Delivery::reject`]. Unsettled deliveries are redelivered once the
/// channel goes away.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    /// Creates a delivery that is not bound to any broker acknowledger.
    pub fn new(delivery_tag: u64, routing_key: &str, data: Vec<u8>) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
            data,
            acker: None,
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(|ct| ct.as_str())
    }

    /// Extracts the trace context propagated in the delivery headers.
    pub fn trace_context(&self) -> Context {
        otel::extract_context(&self.properties)
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker
                .ack()
                .await
                .map_err(|err| AmqpError::AckMessageError(err.to_string())),
            None => Err(AmqpError::AckMessageError(format!(
                "delivery {} has no acknowledger",
                self.delivery_tag
            ))),
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker
                .nack(requeue)
                .await
                .map_err(|err| AmqpError::NackMessageError(err.to_string())),
            None => Err(AmqpError::NackMessageError(format!(
                "delivery {} has no acknowledger",
                self.delivery_tag
            ))),
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        match &self.acker {
            Some(acker) => acker
                .reject(requeue)
                .await
                .map_err(|err| AmqpError::NackMessageError(err.to_string())),
            None => Err(AmqpError::NackMessageError(format!(
                "delivery {} has no acknowledger",
                self.delivery_tag
            ))),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("content_type", &self.content_type())
            .field("data", &String::from_utf8_lossy(&self.data))
            .finish()
    }
}
