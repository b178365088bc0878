// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Subscriber
//!
//! This module provides the consuming side of the event hub. A subscriber owns
//! one queue bound to an exchange with a routing pattern, optionally wired to a
//! dead-letter exchange, and feeds every delivery to a single [`EventHandler`].
//!
//! The consume loop processes deliveries one at a time. When the broker link is
//! replaced after a failure, the loop waits for the connection manager to commit
//! the new link, declares the topology again and re-registers the consumer under
//! the same tag.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    config::SubscriberConfig,
    connection::ConnectionManager,
    consumer::{process_delivery, EventHandler},
    errors::EventHubError,
    exchange::{ExchangeDefinition, ExchangeKind},
    otel,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Routing pattern used to bind a dead-letter queue when no dead-letter routing
/// key is configured.
pub const DEAD_LETTER_CATCH_ALL: &str = "#";

/// Consumes events from one queue.
pub struct EventSubscriber {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<ConnectionManager>,
    config: SubscriberConfig,
    // name of the declared queue once initialized
    queue: Mutex<Option<String>>,
    registration: Mutex<Option<Registration>>,
}

struct Registration {
    consumer_tag: String,
    // channel the consumer currently lives on; replaced on resume
    channel: Arc<parking_lot::Mutex<Arc<dyn AmqpChannel>>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventSubscriber {
    pub fn new(manager: Arc<ConnectionManager>, config: SubscriberConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                config,
                queue: Mutex::new(None),
                registration: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.inner.config
    }

    /// Declares exchange, queue, dead-letter routing and binding, then applies
    /// the prefetch limit. Does nothing once initialized.
    pub async fn initialize(&self) -> Result<(), EventHubError> {
        self.inner.ensure_initialized().await.map(|_| ())
    }

    /// Name of the declared queue, broker generated when configured empty.
    pub async fn queue_name(&self) -> Option<String> {
        self.inner.queue.lock().await.clone()
    }

    /// Starts consuming with `handler` and returns the consumer tag.
    ///
    /// Only one registration may be active per subscriber. Deliveries are handed
    /// to the handler one at a time and the registration survives reconnects.
    ///
    /// # Parameters
    /// * `handler` - Receives each decoded event with its settlement context
    ///
    /// # Returns
    /// The consumer tag on success, `AlreadySubscribed` when a registration is
    /// active, or the failure to declare the topology or start consuming
    pub async fn subscribe<T, H>(&self, handler: H) -> Result<String, EventHubError>
    where
        T: DeserializeOwned + Send + 'static,
        H: EventHandler<T> + 'static,
    {
        let mut registration = self.inner.registration.lock().await;
        if let Some(active) = registration.as_ref() {
            return Err(EventHubError::AlreadySubscribed(active.consumer_tag.clone()));
        }

        let queue = self.inner.ensure_initialized().await?;
        let consumer_tag = self
            .inner
            .config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4()));

        let channel = self.inner.manager.get_channel().await?;
        let generation = self.inner.manager.status().generation;

        debug!("creating consumer: {} on queue: {}", consumer_tag, queue);
        let stream = channel.basic_consume(&queue, &consumer_tag).await?;
        info!(
            queue = queue.as_str(),
            consumer_tag = consumer_tag.as_str(),
            "subscribed"
        );

        let current = Arc::new(parking_lot::Mutex::new(channel));
        let (stop, stopped) = watch::channel(false);

        let task = tokio::spawn(consume_loop::<T, H>(
            self.inner.clone(),
            Arc::new(handler),
            stream,
            ConsumerState {
                consumer_tag: consumer_tag.clone(),
                channel: current.clone(),
                generation,
                stopped,
            },
        ));

        *registration = Some(Registration {
            consumer_tag: consumer_tag.clone(),
            channel: current,
            stop,
            task,
        });

        Ok(consumer_tag)
    }

    pub async fn is_subscribed(&self) -> bool {
        self.inner.registration.lock().await.is_some()
    }

    /// Cancels the active registration. The message in flight, if any, finishes
    /// first unless the broker refuses the cancellation, in which case the
    /// consume loop is aborted. Calling it without a registration is a no-op.
    pub async fn unsubscribe(&self) {
        let Some(registration) = self.inner.registration.lock().await.take() else {
            return;
        };

        let _ = registration.stop.send(true);
        let channel = registration.channel.lock().clone();

        match channel.basic_cancel(&registration.consumer_tag).await {
            Ok(()) => info!(
                consumer_tag = registration.consumer_tag.as_str(),
                "unsubscribed"
            ),
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    consumer_tag = registration.consumer_tag.as_str(),
                    "failure to cancel consumer, aborting consume loop"
                );
                registration.task.abort();
            }
        }
    }

    /// Unsubscribes and forgets the declared topology; a later `initialize`
    /// declares it again.
    pub async fn close(&self) {
        self.unsubscribe().await;
        self.inner.queue.lock().await.take();
        debug!(queue = self.inner.config.queue.as_str(), "subscriber closed");
    }
}

impl Inner {
    async fn ensure_initialized(&self) -> Result<String, EventHubError> {
        let mut queue = self.queue.lock().await;

        if let Some(name) = queue.as_ref() {
            return Ok(name.clone());
        }

        let name = self.declare().await?;
        *queue = Some(name.clone());

        Ok(name)
    }

    /// Installs the subscriber's topology on the current channel and returns
    /// the queue's actual name.
    async fn declare(&self) -> Result<String, EventHubError> {
        let cfg = &self.config;
        let channel = self.manager.get_channel().await?;

        let mut topology = AmqpTopology::new(channel.clone()).exchange(
            ExchangeDefinition::new(&cfg.exchange)
                .kind(cfg.exchange_kind.clone())
                .with_durable(cfg.exchange_durable),
        );

        let mut queue = QueueDefinition::new(&cfg.queue);
        if cfg.durable {
            queue = queue.durable();
        }
        if cfg.exclusive {
            queue = queue.exclusive();
        }
        if cfg.auto_delete {
            queue = queue.delete();
        }
        if let Some(ttl) = cfg.message_ttl {
            queue = queue.ttl(u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX));
        }

        if let Some(dead_letter) = &cfg.dead_letter {
            queue = queue.dead_letter(&dead_letter.exchange, dead_letter.routing_key.as_deref());

            if let Some(dlq) = &dead_letter.queue {
                topology = topology
                    .exchange(
                        ExchangeDefinition::new(&dead_letter.exchange)
                            .kind(ExchangeKind::Topic)
                            .durable(),
                    )
                    .queue(QueueDefinition::new(dlq).durable())
                    .queue_binding(
                        QueueBinding::new(dlq)
                            .exchange(&dead_letter.exchange)
                            .routing_key(
                                dead_letter
                                    .routing_key
                                    .as_deref()
                                    .unwrap_or(DEAD_LETTER_CATCH_ALL),
                            ),
                    );
            }
        }

        let declared = topology
            .queue(queue)
            .queue_binding(
                QueueBinding::new(&cfg.queue)
                    .exchange(&cfg.exchange)
                    .routing_key(&cfg.routing_key),
            )
            .install()
            .await?;

        let name = declared
            .last()
            .cloned()
            .unwrap_or_else(|| cfg.queue.clone());

        let prefetch = cfg.prefetch.unwrap_or(self.manager.config().prefetch);
        channel.basic_qos(prefetch).await?;

        debug!(
            "queue: {} bound to the exchange: {} with the key: {}",
            name, cfg.exchange, cfg.routing_key
        );

        Ok(name)
    }

    /// Declares the topology again on the newest link and registers the
    /// consumer there.
    async fn resume(
        &self,
        consumer_tag: &str,
    ) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream), EventHubError> {
        let name = self.declare().await?;
        *self.queue.lock().await = Some(name.clone());

        let channel = self.manager.get_channel().await?;
        let stream = channel.basic_consume(&name, consumer_tag).await?;

        Ok((channel, stream))
    }
}

struct ConsumerState {
    consumer_tag: String,
    channel: Arc<parking_lot::Mutex<Arc<dyn AmqpChannel>>>,
    generation: u64,
    stopped: watch::Receiver<bool>,
}

async fn consume_loop<T, H>(
    inner: Arc<Inner>,
    handler: Arc<H>,
    mut stream: DeliveryStream,
    mut state: ConsumerState,
) where
    T: DeserializeOwned + Send + 'static,
    H: EventHandler<T> + 'static,
{
    let tracer = global::tracer(otel::CONSUMER_TRACER);

    loop {
        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    let channel = state.channel.lock().clone();
                    process_delivery::<T, H>(
                        &tracer,
                        delivery,
                        handler.as_ref(),
                        channel,
                        inner.manager.stats_handle(),
                        &inner.config,
                    )
                    .await;
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        if *state.stopped.borrow() {
            break;
        }

        warn!(
            consumer_tag = state.consumer_tag.as_str(),
            "delivery stream ended, waiting for a new broker link"
        );

        let generation = tokio::select! {
            generation = inner.manager.wait_for_link(state.generation) => generation,
            _ = state.stopped.changed() => break,
        };

        let generation = match generation {
            Ok(generation) => generation,
            Err(err) => {
                info!(error = err.to_string(), "stopping consume loop");
                break;
            }
        };
        state.generation = generation;

        if *state.stopped.borrow() {
            break;
        }

        match inner.resume(&state.consumer_tag).await {
            Ok((channel, next)) => {
                *state.channel.lock() = channel;
                stream = next;
                info!(
                    consumer_tag = state.consumer_tag.as_str(),
                    generation, "consumer resumed"
                );
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to resume consumer");
                stream = futures_util::stream::empty().boxed();
            }
        }
    }

    debug!(consumer_tag = state.consumer_tag.as_str(), "consume loop stopped");
}
