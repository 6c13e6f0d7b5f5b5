// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Helper
//!
//! Dials the broker and hands out ready-to-use [`AmqpContext`]s. The helper
//! keeps nothing but the URL, the connector and the context policy, so it
//! can be cloned freely; every context gets its own connection.

use crate::{
    channel::LapinConnector,
    config::{AmqpConfigs, ContextOptions},
    context::AmqpContext,
    transport::Connector,
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AmqpConnectionHelper {
    url: String,
    connector: Arc<dyn Connector>,
    options: ContextOptions,
}

impl AmqpConnectionHelper {
    /// Creates a helper dialing `url` with `lapin` and default options.
    pub fn new(url: &str) -> AmqpConnectionHelper {
        let name = AmqpConfigs::default().connection_name;
        Self::with_connector(url, Arc::new(LapinConnector::new(&name)))
    }

    /// Creates a helper from loaded settings.
    pub fn from_configs(cfg: &AmqpConfigs) -> AmqpConnectionHelper {
        Self::with_connector(&cfg.url, Arc::new(LapinConnector::new(&cfg.connection_name)))
            .with_options(cfg.context_options())
    }

    /// Creates a helper dialing through `connector`.
    pub fn with_connector(url: &str, connector: Arc<dyn Connector>) -> AmqpConnectionHelper {
        AmqpConnectionHelper {
            url: url.to_owned(),
            connector,
            options: ContextOptions::default(),
        }
    }

    /// Replaces the policy handed to every context this helper creates.
    ///
    /// # Parameters
    /// * `options` - Receive timeout, prefetch count and retry policies
    ///
    /// # Returns
    /// The helper, for chaining
    pub fn with_options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    /// Broker URL every context is dialed with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dials the broker and opens a channel for a context identified by
    /// `consumer_id`, which doubles as its consumer tag.
    ///
    /// # Parameters
    /// * `consumer_id` - Identity of the new context, unique per worker
    ///
    /// # Returns
    /// `None` when the broker cannot be reached; callers should
    /// treat that as "broker unavailable" and retry on their own schedule.
    /// A context whose first channel could not be opened is still returned,
    /// with that failure as its last error.
    pub async fn get_context(&self, consumer_id: &str) -> Option<AmqpContext> {
        debug!(url = self.url.as_str(), consumer = consumer_id, "get amqp context");

        let connection = match self.connector.dial(&self.url).await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    url = self.url.as_str(),
                    "cannot open amqp connection"
                );
                return None;
            }
        };

        let mut ctx = AmqpContext::new(
            connection,
            self.connector.clone(),
            &self.url,
            consumer_id,
            self.options,
        );
        if let Err(err) = ctx.reset().await {
            warn!(error = err.to_string(), consumer = consumer_id, "context starts without a channel");
        }

        Some(ctx)
    }
}
