// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides functionality for declaring the broker topology the event
//! hub relies on: exchanges, queues and the bindings between them.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over an [`AmqpChannel`]

use crate::{
    channel::AmqpChannel,
    errors::EventHubError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology on the broker.
    ///
    /// Returns the declared queue names in declaration order, with broker
    /// generated names filled in.
    async fn install(&self) -> Result<Vec<String>, EventHubError>;
}

/// Topology declared through an [`AmqpChannel`].
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology on the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<Vec<String>, EventHubError> {
        self.install_exchange().await?;
        let declared = self.install_queue().await?;
        self.binding_queues(&declared).await?;

        Ok(self
            .queues
            .iter()
            .filter_map(|def| declared.get(def.name()).cloned())
            .collect())
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), EventHubError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());
            self.channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    /// Declares every queue and maps definition names to actual names.
    async fn install_queue(&self) -> Result<HashMap<String, String>, EventHubError> {
        let mut declared = HashMap::new();

        for def in &self.queues {
            debug!("creating queue: {}", def.name());
            let name = self.channel.queue_declare(def).await?;
            debug!("queue: {} was created", name);
            declared.insert(def.name().to_owned(), name);
        }

        Ok(declared)
    }

    async fn binding_queues(&self, declared: &HashMap<String, String>) -> Result<(), EventHubError> {
        for binding in &self.queues_binding {
            let binding = match declared.get(binding.queue_name()) {
                Some(name) => binding.resolved(name),
                None => binding.clone(),
            };

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );

            self.channel.queue_bind(&binding).await?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}
