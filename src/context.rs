// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Per-delivery handle passed to event handlers.

use crate::{
    channel::{AmqpChannel, Delivery},
    errors::EventHubError,
    stats::{EventHubStats, Stat},
};
use lapin::BasicProperties;
use opentelemetry::Context;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::debug;

/// Delivery information plus settlement operations for one message.
///
/// `ack`, `nack` and `reject` are mutually exclusive: the first one wins and any
/// later call fails with [`EventHubError::AlreadySettled`] without reaching the
/// broker. Under manual acknowledgement a delivery the handler never settles
/// stays unacknowledged until the channel closes.
pub struct EventContext {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: BasicProperties,
    trace_context: Context,
    channel: Arc<dyn AmqpChannel>,
    stats: Arc<EventHubStats>,
    settled: AtomicBool,
}

impl EventContext {
    pub(crate) fn new(
        delivery: &Delivery,
        channel: Arc<dyn AmqpChannel>,
        stats: Arc<EventHubStats>,
        trace_context: Context,
    ) -> Self {
        Self {
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            properties: delivery.properties.clone(),
            trace_context,
            channel,
            stats,
            settled: AtomicBool::new(false),
        }
    }

    /// Positively acknowledges the delivery.
    pub async fn ack(&self) -> Result<(), EventHubError> {
        self.settle()?;
        self.channel.basic_ack(self.delivery_tag).await?;
        self.stats.increment(Stat::Acknowledged);
        debug!(delivery_tag = self.delivery_tag, "message acked");
        Ok(())
    }

    /// Negatively acknowledges the delivery, optionally asking for redelivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), EventHubError> {
        self.settle()?;
        self.channel.basic_nack(self.delivery_tag, requeue).await?;
        self.stats.increment(Stat::Nacked);
        debug!(delivery_tag = self.delivery_tag, requeue, "message nacked");
        Ok(())
    }

    /// Rejects the delivery without requeue; the queue's dead-letter exchange
    /// receives it when one is configured.
    pub async fn reject(&self) -> Result<(), EventHubError> {
        self.settle()?;
        self.channel.basic_reject(self.delivery_tag, false).await?;
        self.stats.increment(Stat::Rejected);
        debug!(delivery_tag = self.delivery_tag, "message rejected");
        Ok(())
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Trace context extracted from the message headers.
    pub fn trace_context(&self) -> &Context {
        &self.trace_context
    }

    fn settle(&self) -> Result<(), EventHubError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(EventHubError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: vec![],
        }
    }

    fn context(channel: MockAmqpChannel, stats: Arc<EventHubStats>) -> EventContext {
        EventContext::new(&delivery(9), Arc::new(channel), stats, Context::new())
    }

    #[tokio::test]
    async fn second_settlement_is_refused_without_reaching_the_broker() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == 9)
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_basic_nack().never();

        let stats = Arc::new(EventHubStats::default());
        let ctx = context(channel, stats.clone());

        ctx.ack().await.unwrap();

        assert_eq!(ctx.ack().await, Err(EventHubError::AlreadySettled(9)));
        assert_eq!(ctx.nack(true).await, Err(EventHubError::AlreadySettled(9)));
        assert!(ctx.is_settled());
        assert_eq!(stats.snapshot().acknowledged, 1);
    }

    #[tokio::test]
    async fn reject_does_not_requeue() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_reject()
            .withf(|tag, requeue| *tag == 9 && !requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let stats = Arc::new(EventHubStats::default());
        let ctx = context(channel, stats.clone());

        ctx.reject().await.unwrap();

        assert_eq!(stats.snapshot().rejected, 1);
        assert_eq!(ctx.routing_key, "order.created");
    }

    #[tokio::test]
    async fn failed_settlement_still_counts_as_settled() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .times(1)
            .returning(|_, _| Err(EventHubError::ChannelClosed));

        let stats = Arc::new(EventHubStats::default());
        let ctx = context(channel, stats.clone());

        assert_eq!(ctx.nack(false).await, Err(EventHubError::ChannelClosed));
        assert!(ctx.is_settled());
        assert_eq!(stats.snapshot().nacked, 0);
    }
}
