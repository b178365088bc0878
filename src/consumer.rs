// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Consumption
//!
//! This module provides the handler boundary and the per-delivery processing used
//! by the subscriber's consume loop: decoding the envelope, opening a consumer
//! span, calling the handler and settling the delivery.
//!
//! Failed deliveries are nacked. They are requeued while the `x-retry-count`
//! header stays below the subscriber's redelivery limit and dropped (or
//! dead-lettered by the broker) once it is reached. Nothing here increments the
//! header, so a message published without it is requeued on every failure.

use crate::{
    channel::{AmqpChannel, Delivery},
    config::SubscriberConfig,
    context::EventContext,
    errors::EventHubError,
    event::BaseEvent,
    otel,
    stats::{EventHubStats, Stat},
};
use async_trait::async_trait;
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, error::Error, sync::Arc};
use tracing::{debug, error, warn};

/// Header carrying the number of times a message was already retried.
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// Error type handlers may return.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Business logic invoked once per decoded event.
///
/// Returning an error nacks the delivery unless the handler already settled it
/// through the context.
#[async_trait]
pub trait EventHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, event: BaseEvent<T>, ctx: &EventContext) -> Result<(), HandlerError>;
}

/// Processes one delivery end to end. Never fails; problems are logged,
/// counted and recorded on the consumer span.
pub(crate) async fn process_delivery<T, H>(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &H,
    channel: Arc<dyn AmqpChannel>,
    stats: Arc<EventHubStats>,
    config: &SubscriberConfig,
) where
    T: DeserializeOwned + Send + 'static,
    H: EventHandler<T> + ?Sized,
{
    stats.increment(Stat::Consumed);

    let (trace_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &delivery.routing_key);

    debug!(
        "received: {} - exchange: {} - tag: {}",
        delivery.routing_key, delivery.exchange, delivery.delivery_tag
    );

    let ctx = EventContext::new(&delivery, channel, stats.clone(), trace_ctx);

    let result = match BaseEvent::<T>::from_slice(&delivery.data) {
        Ok(event) => handler
            .handle(event, &ctx)
            .await
            .map_err(|err| EventHubError::HandlerError(err.to_string())),
        Err(err) => Err(err),
    };

    let err = match result {
        Ok(()) => {
            debug!("message successfully processed");

            if config.manual_ack || ctx.is_settled() {
                span.set_status(Status::Ok);
                return;
            }

            match ctx.ack().await {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                }
            }
            return;
        }
        Err(err) => err,
    };

    stats.increment(Stat::Errors);
    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if ctx.is_settled() {
        warn!(
            error = err.to_string(),
            "error whiling handling msg, message was already settled"
        );
        return;
    }

    let count = retry_count(&delivery.properties);
    let requeue = count < config.max_redeliveries;

    if requeue {
        warn!(
            error = err.to_string(),
            retry_count = count,
            "error whiling handling msg, requeuing for latter"
        );
    } else {
        error!(
            error = err.to_string(),
            retry_count = count,
            "too many attempts, discarding msg"
        );
    }

    if let Err(nack_err) = ctx.nack(requeue).await {
        error!(error = nack_err.to_string(), "error whiling nack msg");
        span.record_error(&nack_err);
    }
}

/// Reads `x-retry-count` from the message headers. Accepts any integer value or
/// a numeric string; anything else counts as zero.
fn retry_count(props: &AMQPProperties) -> i64 {
    let Some(value) = props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_RETRY_COUNT))
    else {
        return 0;
    };

    match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::ShortString(v) => v.as_str().trim().parse().unwrap_or_default(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use lapin::{types::FieldTable, BasicProperties};
    use opentelemetry::global;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
    struct OrderCreated {
        order_id: String,
    }

    enum Outcome {
        Succeed,
        Fail,
        AckThenFail,
        Ack,
    }

    struct RecordingHandler {
        outcome: Outcome,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                seen: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl EventHandler<OrderCreated> for RecordingHandler {
        async fn handle(
            &self,
            event: BaseEvent<OrderCreated>,
            ctx: &EventContext,
        ) -> Result<(), HandlerError> {
            self.seen.lock().push(event.data.order_id);

            match self.outcome {
                Outcome::Succeed => Ok(()),
                Outcome::Fail => Err("inventory service unavailable".into()),
                Outcome::AckThenFail => {
                    ctx.ack().await?;
                    Err("failed after ack".into())
                }
                Outcome::Ack => Ok(ctx.ack().await?),
            }
        }
    }

    fn body() -> Vec<u8> {
        BaseEvent::new(
            "order.created",
            "1.0",
            "order-service",
            OrderCreated {
                order_id: "o-1".to_owned(),
            },
        )
        .to_vec()
        .unwrap()
    }

    fn delivery(data: Vec<u8>, retry_count: Option<AMQPValue>) -> Delivery {
        let mut properties = BasicProperties::default();
        if let Some(value) = retry_count {
            let mut headers = FieldTable::default();
            headers.insert(AMQP_HEADERS_RETRY_COUNT.into(), value);
            properties = properties.with_headers(headers);
        }

        Delivery {
            delivery_tag: 42,
            exchange: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            redelivered: false,
            properties,
            data,
        }
    }

    async fn run(
        handler: &RecordingHandler,
        delivery: Delivery,
        channel: MockAmqpChannel,
        config: &SubscriberConfig,
    ) -> Arc<EventHubStats> {
        let stats = Arc::new(EventHubStats::default());
        let tracer = global::tracer(otel::CONSUMER_TRACER);

        process_delivery::<OrderCreated, _>(
            &tracer,
            delivery,
            handler,
            Arc::new(channel),
            stats.clone(),
            config,
        )
        .await;

        stats
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig::new("orders", "billing", "order.*")
    }

    #[tokio::test]
    async fn envelope_without_type_is_nacked_before_the_handler() {
        let mut raw: serde_json::Value = serde_json::from_slice(&body()).unwrap();
        raw.as_object_mut().unwrap().remove("type");

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|tag, requeue| *tag == 42 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_basic_ack().never();

        let handler = RecordingHandler::new(Outcome::Succeed);
        let stats = run(
            &handler,
            delivery(serde_json::to_vec(&raw).unwrap(), None),
            channel,
            &config(),
        )
        .await;

        assert!(handler.seen.lock().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.consumed, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.nacked, 1);
    }

    #[tokio::test]
    async fn malformed_json_is_nacked() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = RecordingHandler::new(Outcome::Succeed);
        run(&handler, delivery(b"{not json".to_vec(), None), channel, &config()).await;

        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn exhausted_redeliveries_are_not_requeued() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|_, requeue| !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = RecordingHandler::new(Outcome::Fail);
        run(
            &handler,
            delivery(body(), Some(AMQPValue::LongInt(3))),
            channel,
            &config(),
        )
        .await;

        assert_eq!(*handler.seen.lock(), vec!["o-1".to_owned()]);
    }

    #[tokio::test]
    async fn numeric_string_retry_counts_are_honoured() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|_, requeue| !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = RecordingHandler::new(Outcome::Fail);
        run(
            &handler,
            delivery(body(), Some(AMQPValue::LongString("5".into()))),
            channel,
            &config(),
        )
        .await;
    }

    #[tokio::test]
    async fn failures_without_a_retry_header_are_always_requeued() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|_, requeue| *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = RecordingHandler::new(Outcome::Fail);
        let config = config().with_max_redeliveries(1);
        run(&handler, delivery(body(), None), channel, &config).await;
    }

    #[tokio::test]
    async fn auto_ack_settles_successful_deliveries() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == 42)
            .times(1)
            .returning(|_| Ok(()));

        let handler = RecordingHandler::new(Outcome::Succeed);
        let stats = run(
            &handler,
            delivery(body(), None),
            channel,
            &config().with_manual_ack(false),
        )
        .await;

        assert_eq!(stats.snapshot().acknowledged, 1);
    }

    #[tokio::test]
    async fn manual_ack_leaves_settlement_to_the_handler() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));

        let handler = RecordingHandler::new(Outcome::Ack);
        run(&handler, delivery(body(), None), channel, &config()).await;

        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().never();
        channel.expect_basic_nack().never();

        let handler = RecordingHandler::new(Outcome::Succeed);
        run(&handler, delivery(body(), None), channel, &config()).await;
    }

    #[tokio::test]
    async fn auto_ack_skips_deliveries_the_handler_settled() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));

        let handler = RecordingHandler::new(Outcome::Ack);
        run(
            &handler,
            delivery(body(), None),
            channel,
            &config().with_manual_ack(false),
        )
        .await;
    }

    #[tokio::test]
    async fn failure_after_settlement_is_only_logged() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().times(1).returning(|_| Ok(()));
        channel.expect_basic_nack().never();

        let handler = RecordingHandler::new(Outcome::AckThenFail);
        let stats = run(&handler, delivery(body(), None), channel, &config()).await;

        assert_eq!(stats.snapshot().errors, 1);
    }

    #[test]
    fn retry_count_accepts_integers_and_numeric_strings() {
        let props = |value: AMQPValue| {
            let mut headers = FieldTable::default();
            headers.insert(AMQP_HEADERS_RETRY_COUNT.into(), value);
            BasicProperties::default().with_headers(headers)
        };

        assert_eq!(retry_count(&BasicProperties::default()), 0);
        assert_eq!(retry_count(&props(AMQPValue::ShortShortUInt(2))), 2);
        assert_eq!(retry_count(&props(AMQPValue::LongLongInt(7))), 7);
        assert_eq!(retry_count(&props(AMQPValue::LongString(" 4 ".into()))), 4);
        assert_eq!(retry_count(&props(AMQPValue::LongString("many".into()))), 0);
        assert_eq!(retry_count(&props(AMQPValue::Boolean(true))), 0);
    }
}
