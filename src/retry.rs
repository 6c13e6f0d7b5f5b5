// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policies
//!
//! Consumer registration retries two broker calls: QoS negotiation, which
//! reconnects on any failure, and consume registration, which only retries
//! while the broker reports the queue as missing. Both are described by a
//! [`RetryPolicy`] value so the decision can be tested without sleeping.

use crate::errors::TransportError;
use std::time::Duration;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default pause between attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Fixed-backoff retry policy with a retryable-error predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub retry_on: fn(&TransportError) -> bool,
}

impl RetryPolicy {
    /// Retries any failure. Used for QoS negotiation, where each retry
    /// reopens the channel (and the connection if it dropped).
    pub fn reconnect() -> RetryPolicy {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
            retry_on: |_| true,
        }
    }

    /// Retries only "queue not found" answers. Used for consume registration.
    pub fn queue_not_found() -> RetryPolicy {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
            retry_on: TransportError::is_not_found,
        }
    }

    /// Sets how many retries follow the first attempt.
    ///
    /// # Parameters
    /// * `max_retries` - Retry budget; `0` disables retrying
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the pause between a failed attempt and the next one.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether another attempt is allowed after `retries` retries already
    /// happened and the latest attempt failed with `err`.
    pub fn should_retry(&self, retries: u32, err: &TransportError) -> bool {
        retries < self.max_retries && (self.retry_on)(err)
    }
}
