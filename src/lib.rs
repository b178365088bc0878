// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod hub;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod subscriber;
pub mod topology;

pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{EventHandler, HandlerError};
pub use context::EventContext;
pub use errors::EventHubError;
pub use event::{BaseEvent, EventMetadata};
pub use hub::EventHub;
pub use publisher::{BatchEvent, EventPublisher, PublishOptions};
pub use subscriber::EventSubscriber;
