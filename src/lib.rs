// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod errors;
pub mod helper;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod transport;

pub use context::AmqpContext;
pub use errors::AmqpError;
pub use helper::AmqpConnectionHelper;
pub use transport::Delivery;
