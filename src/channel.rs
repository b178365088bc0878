// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Seam
//!
//! This module defines the traits the event hub uses to talk to the broker and
//! their lapin-backed implementation. A [`Connector`] opens a [`Link`]: one
//! connection plus one confirm-capable channel. Failures the broker reports
//! asynchronously are forwarded as [`LinkEvent`]s tagged with the link's
//! generation, so the connection manager can ignore events from links it has
//! already replaced.

use crate::{
    config::ConnectionConfig, errors::EventHubError, exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{FieldTable, LongString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Reply code sent to the broker on a graceful close.
const REPLY_SUCCESS: u16 = 200;

/// Broker answer to a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

impl From<LapinConfirmation> for Confirmation {
    fn from(confirmation: LapinConfirmation) -> Self {
        match confirmation {
            LapinConfirmation::Ack(_) => Confirmation::Ack,
            LapinConfirmation::Nack(_) => Confirmation::Nack,
            LapinConfirmation::NotRequested => Confirmation::NotRequested,
        }
    }
}

/// Resolves once the broker confirms (or refuses) a publish.
pub type ConfirmFuture = BoxFuture<'static, Result<Confirmation, EventHubError>>;

/// Deliveries pushed by the broker to one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, EventHubError>>;

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<LapinDelivery> for Delivery {
    fn from(delivery: LapinDelivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Asynchronous failure reported by the broker for a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    ConnectionLost(String),
    ChannelLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// Handle given to a [`Connector`] to report failures of the link it opens.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSender {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn with_generation(&self, generation: u64) -> Self {
        Self {
            generation,
            tx: self.tx.clone(),
        }
    }

    pub fn notify(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            generation: self.generation,
            kind,
        };

        if self.tx.send(event).is_err() {
            debug!("connection supervisor is gone, dropping link event");
        }
    }
}

/// Broker connection operations the event hub relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Opens a short-lived auxiliary channel and closes it again.
    async fn probe(&self) -> Result<(), EventHubError>;

    async fn close(&self) -> Result<(), EventHubError>;
}

/// Channel operations the event hub relies on.
///
/// A channel is shared by every publisher and subscriber built on the same
/// connection manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), EventHubError>;

    /// Declares a queue and returns its name, which the broker generates when
    /// the definition's name is empty.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, EventHubError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), EventHubError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), EventHubError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmFuture, EventHubError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, EventHubError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), EventHubError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), EventHubError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), EventHubError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), EventHubError>;

    async fn close(&self) -> Result<(), EventHubError>;
}

/// One connection and its confirm channel.
#[derive(Clone)]
pub struct Link {
    pub connection: Arc<dyn AmqpConnection>,
    pub channel: Arc<dyn AmqpChannel>,
}

impl Link {
    pub fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }

    /// Closes the channel, then the connection, logging rather than failing.
    pub async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            warn!(error = err.to_string(), "failure to close channel");
        }

        if let Err(err) = self.connection.close().await {
            warn!(error = err.to_string(), "failure to close connection");
        }
    }
}

/// Opens links to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: LinkEventSender,
    ) -> Result<Link, EventHubError>;
}

/// Maps lapin failures onto the event hub's error type.
///
/// Operations on a dead channel or connection become the retryable closed
/// variants; everything else is wrapped by `context` with lapin's message.
fn lapin_error(err: lapin::Error, context: fn(String) -> EventHubError) -> EventHubError {
    match err {
        lapin::Error::InvalidChannelState(_) => EventHubError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => EventHubError::ConnectionClosed,
        other => context(other.to_string()),
    }
}

/// [`Connector`] backed by lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: LinkEventSender,
    ) -> Result<Link, EventHubError> {
        debug!("creating amqp connection...");

        let mut uri: AMQPUri = config
            .url
            .parse()
            .map_err(EventHubError::ConfigurationError)?;
        uri.query.heartbeat = Some(u16::try_from(config.heartbeat.as_secs()).unwrap_or(u16::MAX));
        uri.query.connection_timeout =
            Some(u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX));

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(config.connection_name.clone()));

        let conn = match Connection::connect_uri(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(lapin_error(err, EventHubError::ConnectionError))
            }
        }?;
        debug!("amqp connected");

        let connection_events = events.clone();
        conn.on_error(move |err| {
            connection_events.notify(LinkEventKind::ConnectionLost(err.to_string()));
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(lapin_error(err, EventHubError::ChannelError))
            }
        }?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| lapin_error(err, EventHubError::ChannelError))?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| lapin_error(err, EventHubError::QoSDeclarationError))?;

        let channel_events = events;
        channel.on_error(move |err| {
            channel_events.notify(LinkEventKind::ChannelLost(err.to_string()));
        });
        debug!("confirm channel created");

        Ok(Link {
            connection: Arc::new(LapinConnection { conn }),
            channel: Arc::new(LapinChannel { channel }),
        })
    }
}

/// [`AmqpConnection`] over a lapin connection.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn probe(&self) -> Result<(), EventHubError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|err| lapin_error(err, EventHubError::ChannelError))?;

        channel
            .close(REPLY_SUCCESS, "health check")
            .await
            .map_err(|err| lapin_error(err, EventHubError::ChannelError))
    }

    async fn close(&self) -> Result<(), EventHubError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| lapin_error(err, EventHubError::ConnectionError))
    }
}

/// [`AmqpChannel`] over a lapin channel in confirm mode.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), EventHubError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(lapin_error(err, EventHubError::DeclareExchangeError))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, EventHubError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    ..QueueDeclareOptions::default()
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(lapin_error(err, EventHubError::DeclareQueueError))
            }
            Ok(queue) => Ok(queue.name().to_string()),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), EventHubError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(EventHubError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), EventHubError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| lapin_error(err, EventHubError::QoSDeclarationError))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmFuture, EventHubError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                lapin_error(err, EventHubError::PublishingError)
            })?;

        Ok(Box::pin(async move {
            confirm
                .await
                .map(Confirmation::from)
                .map_err(|err| lapin_error(err, EventHubError::PublishingError))
        }))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, EventHubError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(lapin_error(err, EventHubError::ConsumerDeclarationError))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|item| {
                item.map(Delivery::from)
                    .map_err(|err| lapin_error(err, EventHubError::ChannelError))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), EventHubError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| lapin_error(err, EventHubError::ConsumerCancelError))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), EventHubError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| lapin_error(err, EventHubError::AckMessageError))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), EventHubError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| lapin_error(err, EventHubError::NackMessageError))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), EventHubError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| lapin_error(err, EventHubError::RejectMessageError))
    }

    async fn close(&self) -> Result<(), EventHubError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| lapin_error(err, EventHubError::ChannelError))
    }
}
