// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! Everything the context sends goes to the default (nameless) direct
//! exchange with the queue name as routing key. This module builds the
//! publish options and the per-message properties: content type, a fresh
//! message id and the propagated OpenTelemetry context.

use crate::otel;
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use uuid::Uuid;

/// The default exchange routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Options for every publish: non-mandatory, non-immediate.
pub(crate) fn publish_options() -> BasicPublishOptions {
    BasicPublishOptions {
        immediate: false,
        mandatory: false,
    }
}

/// Properties for one outgoing message.
pub(crate) fn message_properties(ctx: &Context, content_type: &str) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(otel::inject_headers(ctx)))
}
