// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Adapters
//!
//! `lapin` backed implementations of the capability traits in
//! [`crate::transport`]. This is the only module that talks to the broker.

use crate::{
    errors::TransportError,
    queue::QueueInfo,
    transport::{Acknowledger, AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    /// Creates a connector announcing `connection_name` to the broker.
    pub fn new(connection_name: &str) -> LapinConnector {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(&self, url: &str) -> Result<Box<dyn AmqpConnection>, TransportError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(url, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Box::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(TransportError::from(err))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_closed(&self) -> bool {
        !self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Box::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(TransportError::from(err))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(TransportError::from)
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(TransportError::from)
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        let queue = self
            .channel
            .queue_declare(name, options, arguments)
            .await
            .map_err(TransportError::from)?;

        Ok(QueueInfo::new(
            queue.name().as_str(),
            queue.message_count(),
            queue.consumer_count(),
        ))
    }

    async fn queue_delete(
        &self,
        name: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, TransportError> {
        self.channel
            .queue_delete(name, options)
            .await
            .map_err(TransportError::from)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(TransportError::from)?;

        Ok(consumer
            .map(|result| result.map(into_delivery).map_err(TransportError::from))
            .boxed())
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, options)
            .await
            .map_err(TransportError::from)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(TransportError::from)
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let mut out = Delivery::new(delivery_tag, routing_key.as_str(), data)
        .with_properties(properties)
        .with_acker(Arc::new(LapinAcker { acker }));
    out.exchange = exchange.to_string();
    out.redelivered = redelivered;
    out
}
