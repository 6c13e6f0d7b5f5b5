// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queues the context declares lazily, and the descriptor
//! the broker hands back once a declaration succeeded.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, ShortString},
};
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its declaration parameters.
///
/// The defaults produce a transient queue: non-durable, not auto-deleted,
/// non-exclusive, without extra arguments. This is what
/// [`crate::context::AmqpContext::ensure_queue_exists`] declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and default flags.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }
}

/// Descriptor of a queue the broker confirmed to exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

impl QueueInfo {
    pub fn new(name: &str, message_count: u32, consumer_count: u32) -> QueueInfo {
        QueueInfo {
            name: name.to_owned(),
            message_count,
            consumer_count,
        }
    }
}
