// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the broker connection and its confirm channel, shared by every publisher
//! and subscriber built on it. The manager runs a small state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected ...
//!        any state -> Closed (terminal)
//! ```
//!
//! Asynchronous failures reported by the broker arrive as [`LinkEvent`]s on an
//! internal queue consumed by a single supervisor task, which drops the dead link
//! and schedules one coalesced reconnection sequence. The current state and link
//! generation are broadcast on a `watch` channel so consumers can resume once a
//! fresh link is committed.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Connector, LapinConnector, Link, LinkEvent, LinkEventSender},
    config::ConnectionConfig,
    errors::EventHubError,
    retry::{self, OnRetry, RetryStrategy},
    stats::{EventHubStats, Stat, StatsSnapshot},
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; no further connection attempts are made.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State plus the generation of the last committed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

/// Shared owner of the broker link. Wrap it in an `Arc` and hand it to every
/// publisher and subscriber.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    link: RwLock<Option<Link>>,
    status: watch::Sender<LinkStatus>,
    next_generation: AtomicU64,
    // serializes link establishment; held across the connector await
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    stats: Arc<EventHubStats>,
}

impl ConnectionManager {
    /// Creates a manager backed by lapin. Must be called inside a Tokio runtime.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(LapinConnector))
    }

    /// Creates a manager opening links through `connector`. Must be called
    /// inside a Tokio runtime.
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(LinkStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });

        let inner = Arc::new(Inner {
            config,
            connector,
            link: RwLock::new(None),
            status,
            next_generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect_task: Mutex::new(None),
            events_tx,
            stats: Arc::new(EventHubStats::default()),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx));

        ConnectionManager { inner }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Opens the connection and confirm channel unless already connected.
    ///
    /// A retryable failure with reconnection enabled schedules a reconnect and
    /// returns `Ok`; the link becomes available once that succeeds.
    ///
    /// # Returns
    /// * `Ok(())` - Connected, already connected, or a reconnection is underway
    /// * `Err(EventHubError::ManagerClosed)` - The manager was closed
    /// * `Err(EventHubError)` - A permanent failure, or any failure with
    ///   reconnection disabled
    pub async fn connect(&self) -> Result<(), EventHubError> {
        match self.state() {
            ConnectionState::Closed => return Err(EventHubError::ManagerClosed),
            ConnectionState::Connected if self.is_connected() => return Ok(()),
            ConnectionState::Reconnecting => {
                debug!("reconnection in progress");
                return Ok(());
            }
            _ => {}
        }

        self.inner.status.send_if_modified(|status| {
            if status.state == ConnectionState::Disconnected {
                status.state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(EventHubError::ManagerClosed) => Err(EventHubError::ManagerClosed),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");

                if self.inner.config.reconnect.enabled && err.is_retryable() {
                    self.inner.schedule_reconnect();
                    Ok(())
                } else {
                    self.inner.mark_disconnected();
                    Err(err)
                }
            }
        }
    }

    /// Returns the shared channel, connecting first when needed.
    pub async fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>, EventHubError> {
        Ok(self.live_link().await?.channel)
    }

    /// Returns the live connection, connecting first when needed.
    pub async fn get_connection(&self) -> Result<Arc<dyn AmqpConnection>, EventHubError> {
        Ok(self.live_link().await?.connection)
    }

    async fn live_link(&self) -> Result<Link, EventHubError> {
        if !self.is_connected() {
            self.connect().await?;
        }

        match self.inner.link.read().as_ref() {
            Some(link) if self.state() == ConnectionState::Connected => Ok(link.clone()),
            _ => Err(EventHubError::NotConnected),
        }
    }

    /// True only when the last known state is connected and both the
    /// connection and the channel report open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self
                .inner
                .link
                .read()
                .as_ref()
                .is_some_and(|link| link.is_open())
    }

    /// Proves liveness by opening and closing an auxiliary channel.
    pub async fn health_check(&self) -> bool {
        let connection = match self.inner.link.read().as_ref() {
            Some(link) => link.connection.clone(),
            None => return false,
        };

        match connection.probe().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = err.to_string(), "health check failed");
                false
            }
        }
    }

    /// Shuts the manager down for good.
    ///
    /// Cancels a pending reconnection, then closes channel and connection. Close
    /// failures are logged, never returned. Calling it again is a no-op.
    pub async fn close(&self) {
        let closing = self.inner.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed {
                false
            } else {
                status.state = ConnectionState::Closed;
                true
            }
        });

        if !closing {
            return;
        }

        if let Some(task) = self.inner.reconnect_task.lock().take() {
            debug!("cancelling pending reconnection");
            task.abort();
        }

        let link = self.inner.link.write().take();
        if let Some(link) = link {
            link.close().await;
        }

        self.inner.stats.set_connected(false);
        info!("connection manager closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    /// Subscribes to state and link generation changes.
    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// Waits until a link newer than `after_generation` is connected and
    /// returns its generation. Fails once the manager is closed.
    pub async fn wait_for_link(&self, after_generation: u64) -> Result<u64, EventHubError> {
        let mut rx = self.inner.status.subscribe();

        loop {
            {
                let status = rx.borrow_and_update();
                match status.state {
                    ConnectionState::Closed => return Err(EventHubError::ManagerClosed),
                    ConnectionState::Connected if status.generation > after_generation => {
                        return Ok(status.generation)
                    }
                    _ => {}
                }
            }

            if rx.changed().await.is_err() {
                return Err(EventHubError::ManagerClosed);
            }
        }
    }

    pub fn increment_stat(&self, stat: Stat) {
        self.inner.stats.increment(stat);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> Arc<EventHubStats> {
        self.inner.stats.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Opens a fresh link unless a live one is already committed.
    async fn establish(&self) -> Result<(), EventHubError> {
        let _guard = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Closed => return Err(EventHubError::ManagerClosed),
            ConnectionState::Connected
                if self.link.read().as_ref().is_some_and(|link| link.is_open()) =>
            {
                return Ok(())
            }
            _ => {}
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = LinkEventSender::new(generation, self.events_tx.clone());

        debug!(generation, "opening broker link");
        let link = match self.connector.connect(&self.config, events).await {
            Ok(link) => link,
            Err(err) => {
                self.stats.increment(Stat::Errors);
                return Err(err);
            }
        };

        if self.state() == ConnectionState::Closed {
            link.close().await;
            return Err(EventHubError::ManagerClosed);
        }

        let previous = self.link.write().replace(link);
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connected;
            status.generation = generation;
        });
        self.stats.set_connected(true);
        info!(generation, "connected to broker");

        if let Some(previous) = previous {
            tokio::spawn(async move { previous.close().await });
        }

        Ok(())
    }

    fn mark_disconnected(&self) {
        self.status.send_if_modified(|status| match status.state {
            ConnectionState::Closed | ConnectionState::Reconnecting => false,
            _ => {
                status.state = ConnectionState::Disconnected;
                true
            }
        });
        self.stats.set_connected(false);
    }

    fn on_link_event(self: &Arc<Self>, event: LinkEvent) {
        let status = *self.status.borrow();

        if status.state == ConnectionState::Closed {
            return;
        }

        if event.generation != status.generation {
            debug!(
                generation = event.generation,
                current = status.generation,
                "ignoring event from a replaced link"
            );
            return;
        }

        warn!(event = ?event.kind, "broker link lost unexpectedly");
        self.stats.increment(Stat::Errors);
        self.stats.set_connected(false);

        if let Some(dead) = self.link.write().take() {
            tokio::spawn(async move { dead.close().await });
        }

        if self.config.reconnect.enabled {
            self.schedule_reconnect();
        } else {
            self.status.send_if_modified(|status| {
                if status.state == ConnectionState::Closed {
                    false
                } else {
                    status.state = ConnectionState::Disconnected;
                    true
                }
            });
        }
    }

    /// Starts a reconnection sequence unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>) {
        let scheduled = self.status.send_if_modified(|status| match status.state {
            ConnectionState::Closed | ConnectionState::Reconnecting => false,
            _ => {
                status.state = ConnectionState::Reconnecting;
                true
            }
        });

        if !scheduled {
            debug!("reconnection already scheduled");
            return;
        }

        let strategy = self.config.reconnect.strategy();
        let delay = retry::calculate_delay(0, &strategy);
        info!(delay_ms = delay.as_millis() as u64, "scheduling reconnection");

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(strategy).await;
        });

        let mut slot = self.reconnect_task.lock();
        if self.state() == ConnectionState::Closed {
            task.abort();
        } else {
            *slot = Some(task);
        }
    }

    async fn reconnect(self: Arc<Self>, strategy: RetryStrategy) {
        let on_retry: &OnRetry = &|attempt, err, delay| {
            warn!(
                attempt,
                error = err.to_string(),
                delay_ms = delay.as_millis() as u64,
                "reconnection attempt failed"
            );
        };

        let result = retry::with_retry_when(
            &strategy,
            || {
                let inner = Arc::clone(&self);
                async move { inner.establish().await }
            },
            Some(on_retry),
            |err| *err != EventHubError::ManagerClosed,
        )
        .await;

        {
            // A newer sequence may already own the slot.
            let mut slot = self.reconnect_task.lock();
            let own = tokio::task::try_id();
            if own.is_some() && slot.as_ref().map(JoinHandle::id) == own {
                slot.take();
            }
        }

        match result {
            Ok(()) => info!("reconnected to broker"),
            Err(EventHubError::ManagerClosed) => debug!("manager closed, reconnection stopped"),
            Err(err) => {
                error!(error = err.to_string(), "giving up on reconnection");
                self.status.send_if_modified(|status| {
                    if status.state == ConnectionState::Reconnecting {
                        status.state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }
}

async fn supervise(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_link_event(event);
    }

    debug!("connection supervisor stopped");
}
