// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Hub
//!
//! This module provides the error type shared by every part of the event hub.
//! The `EventHubError` enum covers connection and channel lifecycle failures,
//! topology declarations, publishing and confirmation, consumption and
//! acknowledgment, envelope validation and exhausted retries.

use crate::retry::is_retryable_error;
use thiserror::Error;

/// Represents errors that can occur while talking to the broker through the event hub.
///
/// Each variant provides specific context about what operation failed. Use
/// [`EventHubError::is_retryable`] to decide whether a failure is transient.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventHubError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A configuration value failed validation
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The connection was closed underneath the operation
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was closed underneath the operation
    #[error("channel closed")]
    ChannelClosed,

    /// A connection attempt is in progress and no link is available yet
    #[error("not connected: connection attempt in progress")]
    NotConnected,

    /// The connection manager was closed and refuses new work
    #[error("connection manager is shut down")]
    ManagerClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// A consumer is already registered for this subscriber
    #[error("already subscribed with consumer `{0}`")]
    AlreadySubscribed(String),

    /// Error handing a message to the channel
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker did not confirm a publish in time
    #[error("publisher confirmation timed out after {0}ms")]
    ConfirmTimeout(u64),

    /// The broker negatively confirmed a publish
    #[error("broker rejected message `{0}`")]
    PublishNacked(String),

    /// The channel refused the message because its outgoing buffer is full
    #[error("channel buffer full")]
    ChannelBufferFull,

    /// The event envelope violates a required-field invariant
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Error serializing an event envelope
    #[error("failure to serialize event: {0}")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// The event handler reported a failure
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// The delivery was already acked, nacked or rejected
    #[error("delivery `{0}` was already settled")]
    AlreadySettled(u64),

    /// An operation kept failing until the retry budget ran out
    #[error("operation failed after {retries} retries: {source}")]
    RetriesExhausted {
        retries: u32,
        source: Box<EventHubError>,
    },
}

impl EventHubError {
    /// Tells whether the failure is transient and worth retrying.
    ///
    /// Typed link failures are classified directly; anything carrying a broker or
    /// I/O message falls back to the substring rules of [`is_retryable_error`].
    pub fn is_retryable(&self) -> bool {
        match self {
            EventHubError::ConnectionClosed
            | EventHubError::ChannelClosed
            | EventHubError::NotConnected
            | EventHubError::ConfirmTimeout(_)
            | EventHubError::ChannelBufferFull => true,

            EventHubError::ManagerClosed
            | EventHubError::ConfigurationError(_)
            | EventHubError::InvalidEvent(_)
            | EventHubError::SerializationError(_)
            | EventHubError::ParsePayloadError(_)
            | EventHubError::AlreadySettled(_)
            | EventHubError::AlreadySubscribed(_)
            | EventHubError::RetriesExhausted { .. } => false,

            other => is_retryable_error(other),
        }
    }
}
