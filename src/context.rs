// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Context
//!
//! [`AmqpContext`] is one client session against the broker: it owns a
//! connection and at most one channel, lazily declares the queues it
//! publishes to, lazily registers a consumer for each queue it receives
//! from, and keeps the outcome of its latest operation for poll-style
//! health checks.
//!
//! The context holds no lock. Every operation takes `&mut self`, so sharing
//! one context between tasks needs an external mutex; the supported pattern
//! is one context per worker.
//!
//! ```compile_fail
//! async fn publish_shared(ctx: &amqp_context::context::AmqpContext) {
//!     // a shared reference cannot publish: operations need exclusive access
//!     let _ = ctx.publish_message("jobs", &1).await;
//! }
//! ```

use crate::{
    codec::{Json, ProtoJson},
    config::ContextOptions,
    errors::{AmqpError, CodecError, TransportError},
    publisher::{self, DEFAULT_EXCHANGE},
    queue::{QueueDefinition, QueueInfo},
    transport::{AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryStream},
};
use futures_util::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, QueueDeleteOptions};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, fmt::Debug, sync::Arc};
use tracing::{debug, error, info, warn};

/// A client session with a persistent connection and one channel.
pub struct AmqpContext {
    err: Option<AmqpError>,
    channel: Option<Box<dyn AmqpChannel>>,
    connection: Box<dyn AmqpConnection>,
    connector: Arc<dyn Connector>,
    url: String,
    consumer_id: String,
    options: ContextOptions,
    queues: HashMap<String, QueueInfo>,
    deliveries: HashMap<String, DeliveryStream>,
}

impl AmqpContext {
    /// Wraps an already dialed connection. No channel is open until
    /// [`AmqpContext::reset`] runs.
    ///
    /// # Parameters
    /// * `connection` - The dialed broker connection
    /// * `connector` - Used to redial when the connection drops
    /// * `url` - Broker URL handed to `connector`
    /// * `consumer_id` - Consumer tag for every queue this context receives from
    /// * `options` - Receive timeout, prefetch and retry policies
    pub fn new(
        connection: Box<dyn AmqpConnection>,
        connector: Arc<dyn Connector>,
        url: &str,
        consumer_id: &str,
        options: ContextOptions,
    ) -> AmqpContext {
        AmqpContext {
            err: None,
            channel: None,
            connection,
            connector,
            url: url.to_owned(),
            consumer_id: consumer_id.to_owned(),
            options,
            queues: HashMap::default(),
            deliveries: HashMap::default(),
        }
    }

    /// Identity of this context, used as consumer tag on every queue.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Broker URL the connection is (re)dialed with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Timing and flow-control policy of this context.
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// The channel currently held, if one could be opened.
    pub fn channel(&self) -> Option<&dyn AmqpChannel> {
        self.channel.as_deref()
    }

    /// Whether `queue_name` is known to exist on the current channel.
    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    /// Whether a consumer stream is registered for `queue_name`.
    pub fn has_consumer(&self, queue_name: &str) -> bool {
        self.deliveries.contains_key(queue_name)
    }

    /// Outcome of the most recently completed operation, `None` on success.
    pub fn last_error(&self) -> Option<&AmqpError> {
        self.err.as_ref()
    }

    /// Overrides the recorded outcome, e.g. after a caller-side failure.
    pub fn set_last_error(&mut self, err: AmqpError) {
        self.err = Some(err);
    }

    pub fn reset_error(&mut self) {
        self.err = None;
    }

    /// (Re)establishes a usable channel.
    ///
    /// Redials first if the connection reports itself closed. Opening a new
    /// channel discards both the queue and the consumer registries, since
    /// their entries belong to the replaced channel.
    pub async fn reset(&mut self) -> Result<(), AmqpError> {
        let result = self.reopen().await;
        self.record(result)
    }

    async fn reopen(&mut self) -> Result<(), AmqpError> {
        if self.connection.is_closed() {
            debug!(url = self.url.as_str(), "reopening connection");
            self.connection = self.connector.dial(&self.url).await.map_err(|err| {
                warn!(error = err.to_string(), "cannot open amqp connection");
                AmqpError::ConnectionError {
                    url: self.url.clone(),
                    reason: err.to_string(),
                }
            })?;
        }

        if let Some(old) = self.channel.take() {
            if let Err(err) = old.close().await {
                debug!(error = err.to_string(), "previous channel was already unusable");
            }
        }
        self.queues.clear();
        self.deliveries.clear();

        let channel = self.connection.create_channel().await.map_err(|err| {
            warn!(error = err.to_string(), "cannot open amqp channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        if !channel.is_open() {
            warn!("channel is not open right after creation, this should not happen");
        }

        self.channel = Some(channel);
        Ok(())
    }

    /// Declares `queue_name` with default flags unless it is already known.
    pub async fn ensure_queue_exists(&mut self, queue_name: &str) -> Result<(), AmqpError> {
        self.ensure_queue(&QueueDefinition::new(queue_name)).await
    }

    /// Declares the queue described by `def` unless its name is already known.
    ///
    /// A failed declaration leaves the registry untouched.
    ///
    /// # Parameters
    /// * `def` - Queue name, flags and arguments
    ///
    /// # Returns
    /// `Ok(())` if the queue was already known or is now declared, otherwise
    /// [`AmqpError::DeclareQueueError`]
    pub async fn ensure_queue(&mut self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let result = self.declare(def).await;
        self.record(result)
    }

    async fn declare(&mut self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if self.queues.contains_key(def.name()) {
            return Ok(());
        }

        debug!(queue = def.name(), "declaring queue");
        let channel = self.open_channel()?;
        let info = channel
            .queue_declare(def.name(), def.declare_options(), def.arguments())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = def.name(), "failure to declare queue");
                AmqpError::DeclareQueueError {
                    queue: def.name().to_owned(),
                    reason: err.to_string(),
                }
            })?;

        self.queues.insert(def.name().to_owned(), info);
        Ok(())
    }

    /// Checks a queue on the broker without declaring it.
    pub async fn inspect_queue(&mut self, queue_name: &str) -> Result<QueueInfo, AmqpError> {
        let result = self.inspect(queue_name).await;
        self.record(result)
    }

    async fn inspect(&mut self, queue_name: &str) -> Result<QueueInfo, AmqpError> {
        let def = QueueDefinition::new(queue_name).passive();
        let channel = self.open_channel()?;

        channel
            .queue_declare(queue_name, def.declare_options(), def.arguments())
            .await
            .map_err(|err| AmqpError::DeclareQueueError {
                queue: queue_name.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Deletes a queue and forgets it locally, returning how many messages
    /// it still held.
    pub async fn delete_queue(&mut self, queue_name: &str) -> Result<u32, AmqpError> {
        let result = self.delete(queue_name).await;
        self.record(result)
    }

    async fn delete(&mut self, queue_name: &str) -> Result<u32, AmqpError> {
        let channel = self.open_channel()?;
        let purged = channel
            .queue_delete(queue_name, QueueDeleteOptions::default())
            .await
            .map_err(|err| AmqpError::DeleteQueueError {
                queue: queue_name.to_owned(),
                reason: err.to_string(),
            })?;

        debug!(queue = queue_name, purged, "queue deleted");
        self.queues.remove(queue_name);
        self.deliveries.remove(queue_name);
        Ok(purged)
    }

    /// Sends `message` as JSON to the queue named `queue_name`, declaring the
    /// queue first if needed.
    ///
    /// # Parameters
    /// * `queue_name` - Target queue, used as routing key on the default exchange
    /// * `message` - Any serde-serializable value
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the publish. Failures are also kept
    /// as the context's last error.
    pub async fn publish_message<T>(&mut self, queue_name: &str, message: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Debug + Sync + ?Sized,
    {
        let result = self
            .publish(queue_name, Json::CONTENT_TYPE, message, || Json::encode(message))
            .await;
        self.record(result)
    }

    /// Sends a protobuf message, in its proto3 JSON mapping, to the queue
    /// named `queue_name`, declaring the queue first if needed.
    pub async fn publish_proto_message<M>(&mut self, queue_name: &str, message: &M) -> Result<(), AmqpError>
    where
        M: prost::Message + Serialize,
    {
        let result = self
            .publish(queue_name, ProtoJson::CONTENT_TYPE, message, || ProtoJson::encode(message))
            .await;
        self.record(result)
    }

    async fn publish<D, E>(
        &mut self,
        queue_name: &str,
        content_type: &str,
        message: &D,
        encode: E,
    ) -> Result<(), AmqpError>
    where
        D: Debug + Sync + ?Sized,
        E: FnOnce() -> Result<Vec<u8>, CodecError>,
    {
        debug!(queue = queue_name, content_type, "publishing message");
        self.declare(&QueueDefinition::new(queue_name)).await?;

        let body = match encode() {
            Ok(body) => body,
            Err(err) => {
                error!(error = err.to_string(), queue = queue_name, "failure to serialize message");
                return Err(AmqpError::SerializePayloadError {
                    payload: format!("{:?}", message),
                    reason: err.to_string(),
                });
            }
        };

        let properties = publisher::message_properties(&Context::current(), content_type);
        let channel = self.open_channel()?;
        channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue_name,
                publisher::publish_options(),
                &body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = queue_name, "error publishing message");
                AmqpError::PublishingError {
                    queue: queue_name.to_owned(),
                    payload: format!("{:?}", message),
                    reason: err.to_string(),
                }
            })
    }

    /// Waits for the next message on `queue_name` and decodes it as JSON.
    ///
    /// Returns [`AmqpError::NoMessage`] when nothing arrives within the
    /// receive timeout; callers are expected to poll again. A payload that
    /// fails to decode yields [`AmqpError::ParsePayloadError`], which still
    /// carries the delivery so it can be acknowledged or rejected.
    pub async fn receive_message<T>(&mut self, queue_name: &str) -> Result<(Delivery, T), AmqpError>
    where
        T: DeserializeOwned,
    {
        let result = match self.next_delivery(queue_name).await {
            Ok(delivery) => match Json::decode(&delivery.data) {
                Ok(message) => Ok((delivery, message)),
                Err(err) => Err(AmqpError::ParsePayloadError {
                    delivery: Box::new(delivery),
                    reason: err.to_string(),
                }),
            },
            Err(err) => Err(err),
        };
        self.record(result)
    }

    /// Waits for the next message on `queue_name` and decodes it from the
    /// proto3 JSON mapping into a protobuf message.
    pub async fn receive_proto_message<M>(&mut self, queue_name: &str) -> Result<(Delivery, M), AmqpError>
    where
        M: prost::Message + DeserializeOwned,
    {
        let result = match self.next_delivery(queue_name).await {
            Ok(delivery) => match ProtoJson::decode(&delivery.data) {
                Ok(message) => Ok((delivery, message)),
                Err(err) => Err(AmqpError::ParsePayloadError {
                    delivery: Box::new(delivery),
                    reason: err.to_string(),
                }),
            },
            Err(err) => Err(err),
        };
        self.record(result)
    }

    async fn next_delivery(&mut self, queue_name: &str) -> Result<Delivery, AmqpError> {
        debug!(queue = queue_name, consumer = self.consumer_id.as_str(), "receiving message");

        if !self.deliveries.contains_key(queue_name) {
            if let Err(err) = self.register_consumer(queue_name).await {
                error!(error = err.to_string(), "unable to register consumer");
                return Err(err);
            }
        }

        let timeout = self.options.receive_timeout;
        let Some(stream) = self.deliveries.get_mut(queue_name) else {
            return Err(AmqpError::StreamClosed {
                queue: queue_name.to_owned(),
                consumer: self.consumer_id.clone(),
            });
        };
        let next = tokio::time::timeout(timeout, stream.next()).await;

        match next {
            Err(_) => {
                debug!(consumer = self.consumer_id.as_str(), "no message delivered");
                self.drop_consumer(queue_name).await;
                Err(AmqpError::NoMessage {
                    queue: queue_name.to_owned(),
                })
            }
            Ok(None) => {
                debug!(consumer = self.consumer_id.as_str(), "delivery stream is closed");
                self.drop_consumer(queue_name).await;
                Err(AmqpError::StreamClosed {
                    queue: queue_name.to_owned(),
                    consumer: self.consumer_id.clone(),
                })
            }
            Ok(Some(Err(err))) => {
                warn!(error = err.to_string(), consumer = self.consumer_id.as_str(), "delivery stream failed");
                self.drop_consumer(queue_name).await;
                Err(AmqpError::ConsumerError {
                    queue: queue_name.to_owned(),
                    consumer: self.consumer_id.clone(),
                    reason: err.to_string(),
                })
            }
            Ok(Some(Ok(delivery))) if delivery.data.is_empty() => {
                warn!(consumer = self.consumer_id.as_str(), "delivery body is empty");
                Err(AmqpError::EmptyDelivery {
                    consumer: self.consumer_id.clone(),
                    delivery: Box::new(delivery),
                })
            }
            Ok(Some(Ok(delivery))) => Ok(delivery),
        }
    }

    /// Forgets the stream for `queue_name` and cancels the consumer on the
    /// broker so the next receive registers from scratch.
    async fn drop_consumer(&mut self, queue_name: &str) {
        self.deliveries.remove(queue_name);

        if let Some(channel) = self.channel.as_deref() {
            if let Err(err) = channel
                .basic_cancel(&self.consumer_id, BasicCancelOptions { nowait: false })
                .await
            {
                debug!(error = err.to_string(), consumer = self.consumer_id.as_str(), "cancel failed");
            }
        }
    }

    /// Negotiates QoS and registers a consumer for `queue_name`.
    ///
    /// QoS failures reopen the channel and retry under the reconnect policy.
    /// Consume failures retry under the not-found policy, reopening the
    /// channel before each retry since the broker closes it on a 404. Every
    /// reopened channel negotiates QoS again before consuming, so the
    /// consumer always runs with the configured prefetch limit.
    pub(crate) async fn register_consumer(&mut self, queue_name: &str) -> Result<(), AmqpError> {
        self.negotiate_qos(queue_name).await?;

        debug!(queue = queue_name, consumer = self.consumer_id.as_str(), "registering consumer");
        let policy = self.options.not_found;
        let mut retries = 0;
        let stream = loop {
            let err = match self.consume(queue_name).await {
                Ok(stream) => break stream,
                Err(err) => err,
            };

            if !policy.should_retry(retries, &err) {
                return Err(AmqpError::ConsumerDeclarationError {
                    queue: queue_name.to_owned(),
                    consumer: self.consumer_id.clone(),
                    reason: err.to_string(),
                });
            }

            debug!(
                queue = queue_name,
                consumer = self.consumer_id.as_str(),
                "queue not found, retrying"
            );
            retries += 1;
            if let Err(reset_err) = self.reopen().await {
                warn!(error = reset_err.to_string(), "reset before consume retry failed");
            }
            tokio::time::sleep(policy.backoff).await;
            self.negotiate_qos(queue_name).await?;
        };

        self.deliveries.insert(queue_name.to_owned(), stream);
        Ok(())
    }

    async fn negotiate_qos(&mut self, queue_name: &str) -> Result<(), AmqpError> {
        let policy = self.options.reconnect;
        let mut retries = 0;

        loop {
            let err = match self.qos().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !policy.should_retry(retries, &err) {
                return Err(AmqpError::QoSDeclarationError {
                    queue: queue_name.to_owned(),
                    consumer: self.consumer_id.clone(),
                    reason: err.to_string(),
                });
            }

            retries += 1;
            warn!(
                error = err.to_string(),
                queue = queue_name,
                "queue is not available, retrying in {:?}",
                policy.backoff
            );
            tokio::time::sleep(policy.backoff).await;
            if let Err(reset_err) = self.reopen().await {
                warn!(error = reset_err.to_string(), "reset before qos retry failed");
            }
        }
    }

    async fn qos(&mut self) -> Result<(), TransportError> {
        match self.channel.as_deref() {
            Some(channel) => channel.qos(self.options.prefetch_count, false).await,
            None => Err(TransportError::Closed("no open channel".to_owned())),
        }
    }

    async fn consume(&mut self, queue_name: &str) -> Result<DeliveryStream, TransportError> {
        match self.channel.as_deref() {
            Some(channel) => {
                channel
                    .basic_consume(
                        queue_name,
                        &self.consumer_id,
                        BasicConsumeOptions {
                            no_local: false,
                            no_ack: false,
                            exclusive: false,
                            nowait: false,
                        },
                    )
                    .await
            }
            None => Err(TransportError::Closed("no open channel".to_owned())),
        }
    }

    /// Closes the channel, then the connection. The connection close
    /// decides the recorded outcome.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        info!("closing amqp channel and connection");
        if let Some(channel) = self.channel.as_deref() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "failure to close channel");
            }
        }

        let result = self
            .connection
            .close()
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()));
        self.record(result)
    }

    fn open_channel(&self) -> Result<&dyn AmqpChannel, AmqpError> {
        self.channel
            .as_deref()
            .ok_or_else(|| AmqpError::ChannelError("no open channel".to_owned()))
    }

    fn record<T>(&mut self, result: Result<T, AmqpError>) -> Result<T, AmqpError> {
        self.err = result.as_ref().err().cloned();
        result
    }
}
