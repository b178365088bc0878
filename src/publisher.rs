// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! This module provides the publishing side of the event hub. Every payload is
//! wrapped in a [`BaseEvent`] envelope, serialized once and sent persistently to
//! the configured exchange with the routing key doubling as the event type.
//!
//! Sends wait for the broker's publisher confirmation. Transient link failures
//! and broker nacks are retried with exponential backoff. Permanent failures,
//! envelope validation and serialization included, are returned immediately.

use crate::{
    channel::Confirmation,
    config::PublisherConfig,
    connection::ConnectionManager,
    errors::EventHubError,
    event::{BaseEvent, EventMetadata},
    exchange::ExchangeDefinition,
    otel,
    retry::{self, OnRetry},
    stats::Stat,
};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Default content encoding
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";
/// AMQP delivery mode marking a message persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header carrying the publishing service's name.
pub const AMQP_HEADERS_SOURCE: &str = "source";
/// Header carrying the envelope's schema version.
pub const AMQP_HEADERS_VERSION: &str = "version";

/// Optional envelope fields for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub metadata: Option<EventMetadata>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl PublishOptions {
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn with_causation_id(mut self, causation_id: &str) -> Self {
        self.causation_id = Some(causation_id.to_owned());
        self
    }
}

/// One entry of [`EventPublisher::publish_batch`].
#[derive(Debug, Clone)]
pub struct BatchEvent<T> {
    pub routing_key: String,
    pub data: T,
    pub options: PublishOptions,
}

impl<T> BatchEvent<T> {
    pub fn new(routing_key: &str, data: T) -> Self {
        Self {
            routing_key: routing_key.to_owned(),
            data,
            options: PublishOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

/// Publishes typed events to one exchange.
pub struct EventPublisher {
    manager: Arc<ConnectionManager>,
    config: PublisherConfig,
    initialized: OnceCell<()>,
}

impl EventPublisher {
    pub fn new(manager: Arc<ConnectionManager>, config: PublisherConfig) -> Self {
        Self {
            manager,
            config,
            initialized: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Declares the configured exchange. Runs once per publisher; concurrent
    /// callers wait for the same declaration.
    pub async fn initialize(&self) -> Result<(), EventHubError> {
        self.initialized
            .get_or_try_init(|| async {
                let channel = self.manager.get_channel().await?;

                debug!("creating exchange: {}", self.config.exchange);
                let def = ExchangeDefinition::new(&self.config.exchange)
                    .kind(self.config.exchange_kind.clone())
                    .with_durable(self.config.durable);
                channel.exchange_declare(&def).await?;
                debug!("exchange: {} was created", self.config.exchange);

                Ok::<(), EventHubError>(())
            })
            .await
            .map(|_| ())
    }

    /// Publishes `data` under `routing_key` and returns the new event's id.
    ///
    /// Transient failures and broker nacks are retried with the configured
    /// backoff. Permanent failures are returned at once.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key, also used as the event type
    /// * `data` - Event payload
    /// * `options` - Correlation, causation and metadata for the envelope
    ///
    /// # Returns
    /// * `Result<String, EventHubError>` - The published event's id, or the
    ///   failure that stopped the publish
    pub async fn publish<T: Serialize>(
        &self,
        routing_key: &str,
        data: T,
        options: PublishOptions,
    ) -> Result<String, EventHubError> {
        let event = BaseEvent::new(routing_key, &self.config.version, &self.config.source, data)
            .with_correlation_id(options.correlation_id)
            .with_causation_id(options.causation_id)
            .with_metadata(options.metadata);
        event.validate()?;

        let payload = event.to_vec()?;
        let properties = self.properties(&event, routing_key, &Context::current());

        let on_retry: &OnRetry = &|attempt, err, delay| {
            warn!(
                attempt,
                error = err.to_string(),
                delay_ms = delay.as_millis() as u64,
                "publish failed, retrying"
            );
        };

        let result = retry::with_retry_when(
            &self.config.retry,
            || self.send(routing_key, &payload, properties.clone()),
            Some(on_retry),
            should_resend,
        )
        .await;

        match result {
            Ok(()) => {
                self.manager.increment_stat(Stat::Published);
                debug!(
                    "event: {} published to: {} with the key: {}",
                    event.id, self.config.exchange, routing_key
                );
                Ok(event.id)
            }
            Err(err) => {
                self.manager.increment_stat(Stat::Errors);
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
        }
    }

    /// Publishes events one after another in the given order. The first failure
    /// stops the batch and is returned.
    ///
    /// # Parameters
    /// * `events` - Routing keys, payloads and options, in publish order
    ///
    /// # Returns
    /// The ids of every published event in order, or the first failure. Events
    /// published before the failure stay published.
    pub async fn publish_batch<T: Serialize>(
        &self,
        events: Vec<BatchEvent<T>>,
    ) -> Result<Vec<String>, EventHubError> {
        let mut ids = Vec::with_capacity(events.len());

        for event in events {
            let id = self
                .publish(&event.routing_key, event.data, event.options)
                .await?;
            ids.push(id);
        }

        Ok(ids)
    }

    /// Releases the publisher. The shared channel belongs to the connection
    /// manager and stays open.
    pub async fn close(&self) {
        debug!(exchange = self.config.exchange.as_str(), "publisher closed");
    }

    async fn send(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), EventHubError> {
        self.initialize().await?;
        let channel = self.manager.get_channel().await?;

        let confirm = channel
            .basic_publish(&self.config.exchange, routing_key, payload, properties)
            .await?;

        if !self.config.confirm {
            return Ok(());
        }

        match tokio::time::timeout(self.config.confirm_timeout, confirm).await {
            Err(_) => Err(EventHubError::ConfirmTimeout(
                u64::try_from(self.config.confirm_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            Ok(Err(err)) => Err(err),
            Ok(Ok(Confirmation::Nack)) => Err(EventHubError::PublishNacked(routing_key.to_owned())),
            Ok(Ok(_)) => Ok(()),
        }
    }

    fn properties<T>(&self, event: &BaseEvent<T>, routing_key: &str, ctx: &Context) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_SOURCE),
            AMQPValue::LongString(LongString::from(event.source.clone())),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_VERSION),
            AMQPValue::LongString(LongString::from(event.version.clone())),
        );

        if let Some(metadata) = &event.metadata {
            for (key, value) in metadata.to_map() {
                headers.insert(ShortString::from(key), json_to_amqp(value));
            }
        }

        otel::inject_context(ctx, &mut headers);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.config.content_type.clone()))
            .with_content_encoding(ShortString::from(self.config.content_encoding.clone()))
            .with_message_id(ShortString::from(event.id.clone()))
            .with_timestamp(u64::try_from(event.timestamp.timestamp_millis()).unwrap_or_default())
            .with_type(ShortString::from(routing_key))
            .with_headers(FieldTable::from(headers));

        if let Some(correlation_id) = &event.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }

        if self.config.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        if let Some(priority) = event.metadata.as_ref().and_then(|m| m.priority) {
            properties = properties.with_priority(priority);
        }

        properties
    }
}

/// Broker nacks are resent along with transient link failures.
fn should_resend(err: &EventHubError) -> bool {
    matches!(err, EventHubError::PublishNacked(_)) || err.is_retryable()
}

/// Converts a JSON metadata value into the closest AMQP header value.
fn json_to_amqp(value: Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => AMQPValue::LongLongInt(v),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v)),
        Value::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.into_iter().map(json_to_amqp).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(FieldTable::from(
            map.into_iter()
                .map(|(key, value)| (ShortString::from(key), json_to_amqp(value)))
                .collect::<BTreeMap<_, _>>(),
        )),
    }
}
