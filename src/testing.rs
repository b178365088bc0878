// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker links for unit tests.

use crate::{
    channel::{
        AmqpChannel, AmqpConnection, Confirmation, ConfirmFuture, Connector, DeliveryStream, Link,
        LinkEventKind, LinkEventSender,
    },
    config::ConnectionConfig,
    errors::EventHubError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

/// Connector handing out fake links whose failures tests trigger by hand.
pub(crate) struct FakeConnector {
    attempts: AtomicUsize,
    failures: Mutex<(usize, String)>,
    probe_fails: Arc<AtomicBool>,
    current: Mutex<Option<(LinkEventSender, Arc<AtomicBool>)>>,
    channel: Option<Arc<dyn AmqpChannel>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every link uses `channel` instead of a permissive fake one.
    pub(crate) fn with_channel(channel: Arc<dyn AmqpChannel>) -> Arc<Self> {
        Arc::new(Self::build(Some(channel)))
    }

    fn build(channel: Option<Arc<dyn AmqpChannel>>) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures: Mutex::new((0, String::new())),
            probe_fails: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
            channel,
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Makes the next `count` connection attempts fail with `message`.
    pub(crate) fn fail_next(&self, count: usize, message: &str) {
        *self.failures.lock() = (count, message.to_owned());
    }

    pub(crate) fn set_probe_failure(&self, fails: bool) {
        self.probe_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn link_open(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|(_, open)| open.load(Ordering::SeqCst))
    }

    /// Kills the current link and reports it the way the broker would.
    pub(crate) fn drop_link(&self, kind: LinkEventKind) {
        if let Some((events, open)) = self.current.lock().as_ref() {
            open.store(false, Ordering::SeqCst);
            events.notify(kind);
        }
    }

    /// Reports a failure tagged with an arbitrary link generation.
    pub(crate) fn notify_generation(&self, generation: u64, kind: LinkEventKind) {
        if let Some((events, _)) = self.current.lock().as_ref() {
            events.with_generation(generation).notify(kind);
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
        events: LinkEventSender,
    ) -> Result<Link, EventHubError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock();
            if failures.0 > 0 {
                failures.0 -= 1;
                return Err(EventHubError::ConnectionError(failures.1.clone()));
            }
        }

        let open = Arc::new(AtomicBool::new(true));
        *self.current.lock() = Some((events, open.clone()));

        let channel: Arc<dyn AmqpChannel> = match &self.channel {
            Some(channel) => channel.clone(),
            None => Arc::new(FakeChannel { open: open.clone() }),
        };

        Ok(Link {
            connection: Arc::new(FakeConnection {
                open,
                probe_fails: self.probe_fails.clone(),
            }),
            channel,
        })
    }
}

struct FakeConnection {
    open: Arc<AtomicBool>,
    probe_fails: Arc<AtomicBool>,
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<(), EventHubError> {
        if self.probe_fails.load(Ordering::SeqCst) || !self.is_open() {
            return Err(EventHubError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EventHubError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Channel accepting every operation while its link is open.
struct FakeChannel {
    open: Arc<AtomicBool>,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), EventHubError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventHubError::ChannelClosed)
        }
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, _def: &ExchangeDefinition) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, EventHubError> {
        self.ensure_open()?;
        Ok(def.name().to_owned())
    }

    async fn queue_bind(&self, _binding: &QueueBinding) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        _payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<ConfirmFuture, EventHubError> {
        self.ensure_open()?;
        Ok(Box::pin(async { Ok::<_, EventHubError>(Confirmation::Ack) }))
    }

    async fn basic_consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, EventHubError> {
        self.ensure_open()?;
        Ok(stream::pending().boxed())
    }

    async fn basic_cancel(&self, _consumer_tag: &str) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn basic_ack(&self, _delivery_tag: u64) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn basic_nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn basic_reject(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), EventHubError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), EventHubError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
