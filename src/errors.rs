// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Context
//!
//! This module provides the error types used across the crate. `AmqpError` is
//! what every context operation returns (and what the context keeps as its
//! last observed outcome), `TransportError` is what the broker capability
//! traits return, and `ConfigError` covers settings loading.

use crate::transport::Delivery;
use thiserror::Error;

/// AMQP reply code the broker uses for "queue not found".
pub const NOT_FOUND_REPLY_CODE: u16 = 404;

/// Represents errors that can occur during messaging context operations.
///
/// Each variant carries the operation-identifying context (queue name,
/// consumer identity, payload description) needed to diagnose a failure
/// without threading extra state through the call site.
#[derive(Error, Debug, Clone)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect to `{url}`: {reason}")]
    ConnectionError { url: String, reason: String },

    /// Error creating a channel from an established connection, or using a
    /// context whose channel could not be opened
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{queue}`: {reason}")]
    DeclareQueueError { queue: String, reason: String },

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{queue}`: {reason}")]
    DeleteQueueError { queue: String, reason: String },

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload [{payload}]: {reason}")]
    SerializePayloadError { payload: String, reason: String },

    /// Error publishing a message
    #[error("failure to publish [{payload}] to queue `{queue}`: {reason}")]
    PublishingError {
        queue: String,
        payload: String,
        reason: String,
    },

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos on queue `{queue}` for consumer `{consumer}`: {reason}")]
    QoSDeclarationError {
        queue: String,
        consumer: String,
        reason: String,
    },

    /// Error registering a consumer on a queue
    #[error("failure to consume queue `{queue}` for consumer `{consumer}`: {reason}")]
    ConsumerDeclarationError {
        queue: String,
        consumer: String,
        reason: String,
    },

    /// No message arrived within the receive window; callers should poll again
    #[error("no message found in queue `{queue}`")]
    NoMessage { queue: String },

    /// The broker pushed a delivery without a body; the delivery is kept so
    /// the caller can still reject it
    #[error("delivery body is empty, consumer `{consumer}`")]
    EmptyDelivery {
        consumer: String,
        delivery: Box<Delivery>,
    },

    /// The broker dropped the consumer and its delivery stream ended
    #[error("delivery stream closed for consumer `{consumer}` on queue `{queue}`")]
    StreamClosed { queue: String, consumer: String },

    /// The delivery stream yielded an error instead of a delivery
    #[error("failure to consume message from queue `{queue}` for consumer `{consumer}`: {reason}")]
    ConsumerError {
        queue: String,
        consumer: String,
        reason: String,
    },

    /// Error parsing a delivery payload; the delivery is kept so the caller
    /// can still inspect, ack or reject it
    #[error("failure to parse payload: {reason}")]
    ParsePayloadError {
        delivery: Box<Delivery>,
        reason: String,
    },

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging or rejecting a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error closing the connection
    #[error("failure to close the connection: {0}")]
    CloseError(String),
}

impl AmqpError {
    /// Whether this is the "nothing arrived in this window" outcome.
    pub fn is_no_message(&self) -> bool {
        matches!(self, AmqpError::NoMessage { .. })
    }

    /// The delivery carried by a malformed-delivery failure, if any.
    ///
    /// # Returns
    /// The unsettled delivery for [`AmqpError::EmptyDelivery`] and
    /// [`AmqpError::ParsePayloadError`], `None` for every other variant
    pub fn delivery(&self) -> Option<&Delivery> {
        match self {
            AmqpError::EmptyDelivery { delivery, .. }
            | AmqpError::ParsePayloadError { delivery, .. } => Some(delivery),
            _ => None,
        }
    }
}

/// Errors reported by the broker capability traits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker answered with reply code 404
    #[error("not found: {0}")]
    NotFound(String),

    /// The channel or connection is not in a usable state
    #[error("channel or connection closed: {0}")]
    Closed(String),

    /// Any other protocol or IO failure
    #[error("{0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp_err) if amqp_err.get_id() == NOT_FOUND_REPLY_CODE => {
                TransportError::NotFound(err.to_string())
            }
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                TransportError::Closed(err.to_string())
            }
            _ => TransportError::Protocol(err.to_string()),
        }
    }
}

/// Errors turning messages into payloads and back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message could not be serialized
    #[error("failure to encode message: {0}")]
    Encode(String),

    /// The payload does not match the expected message shape
    #[error("failure to decode payload: {0}")]
    Decode(String),
}

/// Errors loading settings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}
