// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers: published messages
//! carry the caller's current context, and deliveries expose it again through
//! [`crate::transport::Delivery::trace_context`].

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Text-map view over an AMQP header table.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(error = err.to_string(), header = key, "header is not utf-8"))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects `ctx` into a fresh header table using the global propagator.
///
/// With no propagator installed the table stays empty.
pub(crate) fn inject_headers(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderCarrier::new(&mut headers))
    });

    headers
}

/// Reads the context a publisher injected into `properties`.
pub(crate) fn extract_context(properties: &BasicProperties) -> Context {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercased_and_readable() {
        let mut headers = BTreeMap::new();
        let mut propagator = HeaderCarrier::new(&mut headers);

        propagator.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn non_string_headers_are_ignored() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("retries"), AMQPValue::LongInt(3));
        let propagator = HeaderCarrier::new(&mut headers);

        assert_eq!(propagator.get("retries"), None);
    }

    #[test]
    fn nothing_is_injected_without_a_propagator() {
        assert!(inject_headers(&Context::current()).is_empty());
    }

    #[test]
    fn missing_headers_extract_an_empty_context() {
        use opentelemetry::trace::TraceContextExt;

        let ctx = extract_context(&BasicProperties::default());

        assert!(!ctx.span().span_context().is_valid());
    }
}
