// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connection Manager
//!
//! This module supervises a single logical broker connection. A driver task,
//! spawned when the manager is created, owns the connection state machine:
//!
//! - `Connecting` → `Connected` when the broker accepts the connection
//! - `Connecting` → `Connecting` on failure, after a jittered backoff
//! - `Connected` → `Connecting` when the connection reports an error
//! - `Connecting` → `PermanentlyFailed` once the retry budget is exhausted
//!
//! Every transition happens on the driver task, so transitions never race.
//! Lifecycle changes are announced on the manager's `EventBus`.
//!
//! Callers obtain channels with `acquire_channel`. The callback is invoked
//! with a fresh channel after the first connection, and again after every
//! reconnection, until the registration is cancelled.

use crate::{
    backoff::Backoff,
    channel::LapinBroker,
    configs::ConnectionConfig,
    errors::AmqpError,
    events::{EventBus, Signal, SubscriptionId},
    log::{LogSink, TracingSink, TAG_ERROR, TAG_INFO, TAG_RABBITMQ, TAG_WARNING},
    transport::{Broker, BrokerConnection, ChannelOf},
};
use serde_json::{json, Value};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};


/// Observable snapshot of the manager's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    PermanentlyFailed,
    Shutdown,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::PermanentlyFailed => write!(f, "permanently failed"),
            ConnectionStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

enum ConnectionState<C> {
    Disconnected,
    Connecting {
        attempt: u32,
    },
    Connected {
        connection: Arc<C>,
        generation: u64,
        watcher: SubscriptionId,
    },
    PermanentlyFailed,
}

impl<C> ConnectionState<C> {
    fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting { attempt } => ConnectionStatus::Connecting { attempt: *attempt },
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::PermanentlyFailed => ConnectionStatus::PermanentlyFailed,
        }
    }
}

enum Lookup<C> {
    Ready(Arc<C>, u64),
    Pending,
    Gone,
}

struct Shared<B: Broker> {
    config: ConnectionConfig,
    broker: B,
    backoff: Backoff,
    events: Arc<EventBus>,
    sink: Arc<dyn LogSink>,
    state: Mutex<ConnectionState<B::Connection>>,
    status: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
    // generation of the live connection, zero once it failed or none exists
    current: AtomicU64,
    registrations: Mutex<Vec<Weak<Rearm>>>,
    fatal: Mutex<Option<AmqpError>>,
    shutdown: CancellationToken,
    runtime: Handle,
}

/// Supervises one logical connection to a RabbitMQ broker.
///
/// The manager starts connecting as soon as it is created and keeps the
/// connection alive until the retry budget is exhausted or `shutdown` is
/// called. Dropping the manager shuts it down.
pub struct ConnectionManager<B: Broker> {
    shared: Arc<Shared<B>>,
    driver: Mutex<Option<JoinHandle<Result<(), AmqpError>>>>,
}

impl ConnectionManager<LapinBroker> {
    /// Creates a manager connecting through `lapin`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn lapin(config: ConnectionConfig) -> Result<Self, AmqpError> {
        let broker = LapinBroker::new(&config);
        ConnectionManager::new(config, broker)
    }
}

impl<B: Broker> ConnectionManager<B> {
    /// Creates a manager that logs lifecycle records through `tracing`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Parameters
    /// * `config` - The connection configuration
    /// * `broker` - The broker transport
    ///
    /// # Returns
    /// The running manager, or an error if the configuration is invalid or
    /// no tokio runtime is available
    pub fn new(config: ConnectionConfig, broker: B) -> Result<Self, AmqpError> {
        ConnectionManager::with_sink(config, broker, Arc::new(TracingSink))
    }

    /// Creates a manager that sends lifecycle records to the given sink.
    pub fn with_sink(
        config: ConnectionConfig,
        broker: B,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, AmqpError> {
        config.validate()?;

        let runtime = match Handle::try_current() {
            Ok(handle) => Ok(handle),
            Err(err) => {
                error!(error = err.to_string(), "connection manager requires a tokio runtime");
                Err(AmqpError::InternalError)
            }
        }?;

        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let shared = Arc::new(Shared {
            backoff: Backoff::from_config(&config),
            config,
            broker,
            events: EventBus::new(),
            sink,
            state: Mutex::new(ConnectionState::Disconnected),
            status,
            generation: AtomicU64::new(0),
            current: AtomicU64::new(0),
            registrations: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            shutdown: CancellationToken::new(),
            runtime,
        });

        let driver = shared.runtime.spawn(drive(shared.clone()));

        Ok(ConnectionManager {
            shared,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Registers a callback that receives a channel once connected, and a
    /// fresh one after every reconnection.
    ///
    /// The callback never runs on the caller's stack. It is never invoked if
    /// the manager fails permanently or is shut down first.
    ///
    /// # Parameters
    /// * `on_ready` - Invoked with each delivered channel
    ///
    /// # Returns
    /// A handle to observe or cancel the registration
    pub fn acquire_channel<F>(&self, on_ready: F) -> ChannelRegistration
    where
        F: Fn(ChannelOf<B>) + Send + Sync + 'static,
    {
        let rearm = Arc::new(Rearm::default());
        self.shared.register(&rearm);

        Acquisition {
            shared: Arc::downgrade(&self.shared),
            on_ready: Arc::new(on_ready),
            rearm: rearm.clone(),
        }
        .start();

        ChannelRegistration {
            events: self.shared.events.clone(),
            rearm,
        }
    }

    /// Waits for a connection and opens a single channel on it.
    ///
    /// Unlike `acquire_channel`, nothing is delivered after a reconnection.
    pub async fn open_channel(&self) -> Result<ChannelOf<B>, AmqpError> {
        match self.shared.current_connection().await {
            Some((connection, _)) => connection.open_channel().await,
            None => Err(self.shared.terminal_error()),
        }
    }

    /// Checks whether `attempt` is still within the retry budget.
    ///
    /// # Returns
    /// Ok(()) while the attempt is allowed, or AmqpError::TooManyRetries
    pub fn ensure_retry_budget(&self, attempt: u32) -> Result<(), AmqpError> {
        self.shared.ensure_retry_budget(attempt)
    }

    /// The bus carrying `connected`, `connection_error` and `connect_failed`.
    pub fn events(&self) -> Arc<EventBus> {
        self.shared.events.clone()
    }

    /// The manager's current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Subscribes to lifecycle status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// The configuration the manager was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Stops reconnecting and releases the current connection.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Waits for the driver to stop.
    ///
    /// # Returns
    /// Ok(()) after `shutdown`, or AmqpError::TooManyRetries once the retry
    /// budget is exhausted
    pub async fn join(&self) -> Result<(), AmqpError> {
        let driver = self.driver.lock().ok().and_then(|mut slot| slot.take());

        match driver {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!(error = err.to_string(), "connection driver task failed");
                    Err(AmqpError::InternalError)
                }
            },
            None => match self.shared.fatal() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}

impl<B: Broker> Drop for ConnectionManager<B> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn drive<B: Broker>(shared: Arc<Shared<B>>) -> Result<(), AmqpError> {
    let uri = shared.config.connection_uri();
    let mut retries: u32 = 0;
    let mut next_log_deadline = Instant::now();

    loop {
        shared.set_state(ConnectionState::Connecting { attempt: retries });
        debug!(attempt = retries, "connecting to broker");

        let attempt = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.stop();
                return Ok(());
            }
            attempt = shared.broker.connect(&uri) => attempt,
        };

        let delay = match attempt {
            Ok(connection) => {
                let lost = shared.connected(connection, retries);
                retries = 0;

                let reason = tokio::select! {
                    _ = shared.shutdown.cancelled() => {
                        shared.stop();
                        return Ok(());
                    }
                    reason = lost => reason.ok().flatten(),
                };

                shared.lost(reason);
                shared.backoff.recovery_delay()
            }
            Err(err) => {
                let now = Instant::now();
                if now >= next_log_deadline {
                    shared.log(
                        &[TAG_RABBITMQ, TAG_WARNING],
                        json!({
                            "message": "still offline",
                            "attempts": retries + 1,
                            "address": shared.config.redacted_address(),
                            "error": err.to_string(),
                        }),
                    );
                    next_log_deadline = now + shared.config.log_every();
                }

                let delay = shared.backoff.delay(retries);
                shared.events.publish(Signal::ConnectFailed, Some(err.to_string()));
                retries = retries.saturating_add(1);

                if let Err(fatal) = shared.ensure_retry_budget(retries) {
                    shared.fail(&fatal);
                    return Err(fatal);
                }

                delay
            }
        };

        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.stop();
                return Ok(());
            }
            _ = time::sleep(delay) => {}
        }
    }
}

impl<B: Broker> Shared<B> {
    fn state(&self) -> MutexGuard<'_, ConnectionState<B::Connection>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ConnectionState<B::Connection>) -> ConnectionState<B::Connection> {
        let status = next.status();
        let mut state = self.state();
        let previous = std::mem::replace(&mut *state, next);
        self.status.send_replace(status);
        previous
    }

    fn log(&self, tags: &[&str], fields: Value) {
        self.sink.log(tags, &fields);
    }

    fn ensure_retry_budget(&self, attempt: u32) -> Result<(), AmqpError> {
        let max_retries = self.config.retry_limit();

        if max_retries != 0 && attempt > max_retries {
            return Err(AmqpError::TooManyRetries {
                attempt,
                max_retries,
            });
        }

        Ok(())
    }

    /// Enters `Connected`: arms the error watcher, installs the transport
    /// error hook and announces the connection.
    ///
    /// # Returns
    /// A receiver resolved with the failure detail when the watcher fires
    fn connected(
        self: &Arc<Self>,
        connection: B::Connection,
        failed_attempts: u32,
    ) -> oneshot::Receiver<Option<String>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let weak: Weak<Shared<B>> = Arc::downgrade(self);
        let watcher = self.events.subscribe(Signal::ConnectionError, true, move |n| {
            if let Some(shared) = weak.upgrade() {
                shared.invalidate(generation);
            }

            let sender = tx.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(n.detail.clone());
            }
        });

        let connection = Arc::new(connection);
        self.current.store(generation, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected {
            connection: connection.clone(),
            generation,
            watcher,
        });

        // the hook may fire right away, and a transport may report one
        // failure several times
        let weak: Weak<Shared<B>> = Arc::downgrade(self);
        connection.on_error(Box::new(move |err| {
            if let Some(shared) = weak.upgrade() {
                if shared.invalidate(generation) {
                    shared
                        .events
                        .publish(Signal::ConnectionError, Some(err.to_string()));
                }
            }
        }));

        if failed_attempts > 0 {
            self.log(
                &[TAG_RABBITMQ, TAG_INFO],
                json!({
                    "message": "reconnected",
                    "attempts": failed_attempts,
                    "address": self.config.redacted_address(),
                }),
            );
        } else {
            self.log(
                &[TAG_RABBITMQ, TAG_INFO],
                json!({
                    "message": "connected",
                    "address": self.config.redacted_address(),
                }),
            );
        }

        self.events.publish(Signal::Connected, None);
        rx
    }

    fn lost(&self, reason: Option<String>) {
        self.current.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        self.log(
            &[TAG_RABBITMQ, TAG_WARNING],
            json!({
                "message": "connection lost",
                "address": self.config.redacted_address(),
                "error": reason,
            }),
        );
    }

    fn fail(&self, fatal: &AmqpError) {
        if let Ok(mut slot) = self.fatal.lock() {
            *slot = Some(fatal.clone());
        }
        self.set_state(ConnectionState::PermanentlyFailed);
        self.release_registrations();

        self.log(
            &[TAG_RABBITMQ, TAG_ERROR],
            json!({
                "message": "giving up",
                "address": self.config.redacted_address(),
                "error": fatal.to_string(),
            }),
        );
    }

    fn stop(&self) {
        self.current.store(0, Ordering::SeqCst);
        if let ConnectionState::Connected { watcher, .. } = self.set_state(ConnectionState::Disconnected) {
            self.events.unsubscribe(watcher);
        }
        self.status.send_replace(ConnectionStatus::Shutdown);
        self.release_registrations();

        self.log(
            &[TAG_RABBITMQ, TAG_INFO],
            json!({
                "message": "shutdown",
                "address": self.config.redacted_address(),
            }),
        );
    }

    fn fatal(&self) -> Option<AmqpError> {
        self.fatal.lock().ok().and_then(|slot| slot.clone())
    }

    fn terminal_error(&self) -> AmqpError {
        self.fatal().unwrap_or(AmqpError::Shutdown)
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.fatal().is_some()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current.load(Ordering::SeqCst) == generation
    }

    /// Marks the connection with `generation` as failed.
    ///
    /// # Returns
    /// True for the first caller only
    fn invalidate(&self, generation: u64) -> bool {
        self.current
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn register(&self, rearm: &Arc<Rearm>) {
        let mut registrations = self.registrations.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        registrations.retain(|registration| registration.strong_count() > 0);
        registrations.push(Arc::downgrade(rearm));
    }

    /// Removes every registration's outstanding re-arm subscription.
    fn release_registrations(&self) {
        let registrations = std::mem::take(
            &mut *self.registrations.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        for rearm in registrations.iter().filter_map(Weak::upgrade) {
            if let Some(id) = rearm.slot().take() {
                self.events.unsubscribe(id);
            }
        }
    }

    fn lookup(&self) -> Lookup<B::Connection> {
        match &*self.state() {
            ConnectionState::Connected {
                connection,
                generation,
                ..
            } if self.is_current(*generation) => Lookup::Ready(connection.clone(), *generation),
            ConnectionState::PermanentlyFailed => Lookup::Gone,
            _ => Lookup::Pending,
        }
    }

    /// Waits for the current or next connection.
    ///
    /// # Returns
    /// The connection and its generation, or None once the manager stopped
    async fn current_connection(&self) -> Option<(Arc<B::Connection>, u64)> {
        let mut status = self.status.subscribe();

        loop {
            let _ = status.borrow_and_update();

            match self.lookup() {
                Lookup::Ready(connection, generation) => return Some((connection, generation)),
                Lookup::Gone => return None,
                Lookup::Pending => {}
            }

            if self.shutdown.is_cancelled() {
                return None;
            }

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }
}

#[derive(Default)]
struct Rearm {
    slot: Mutex<Option<SubscriptionId>>,
    cancelled: AtomicBool,
    deliveries: AtomicU64,
}

impl Rearm {
    fn slot(&self) -> MutexGuard<'_, Option<SubscriptionId>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, id: SubscriptionId) -> Option<SubscriptionId> {
        self.slot().replace(id)
    }

    fn clear_if(&self, id: SubscriptionId) -> bool {
        let mut slot = self.slot();
        if *slot == Some(id) {
            *slot = None;
            return true;
        }
        false
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to a channel registration made with `acquire_channel`.
pub struct ChannelRegistration {
    events: Arc<EventBus>,
    rearm: Arc<Rearm>,
}

impl ChannelRegistration {
    /// Stops future deliveries and removes the outstanding re-arm subscription.
    pub fn cancel(&self) {
        self.rearm.cancelled.store(true, Ordering::SeqCst);
        if let Some(id) = self.rearm.slot().take() {
            self.events.unsubscribe(id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rearm.is_cancelled()
    }

    /// True while a re-arm subscription is registered on the bus.
    pub fn is_armed(&self) -> bool {
        self.rearm.slot().is_some()
    }

    /// How many channels were handed to the callback so far.
    pub fn deliveries(&self) -> u64 {
        self.rearm.deliveries.load(Ordering::SeqCst)
    }
}

struct Acquisition<B: Broker> {
    shared: Weak<Shared<B>>,
    on_ready: Arc<dyn Fn(ChannelOf<B>) + Send + Sync>,
    rearm: Arc<Rearm>,
}

impl<B: Broker> Clone for Acquisition<B> {
    fn clone(&self) -> Self {
        Acquisition {
            shared: self.shared.clone(),
            on_ready: self.on_ready.clone(),
            rearm: self.rearm.clone(),
        }
    }
}

impl<B: Broker> Acquisition<B> {
    fn start(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.runtime.spawn(self.run());
        }
    }

    async fn run(self) {
        loop {
            if self.rearm.is_cancelled() {
                return;
            }

            let Some(shared) = self.shared.upgrade() else {
                return;
            };

            let Some((connection, generation)) = shared.current_connection().await else {
                debug!("manager stopped before a channel could be delivered");
                return;
            };

            let watcher = self.arm(&shared.events);

            if !shared.is_current(generation) {
                // lost before the watcher was registered
                if !self.disarm(&shared.events, watcher) {
                    return;
                }
                continue;
            }

            match connection.open_channel().await {
                Ok(channel) => {
                    if self.rearm.is_cancelled() {
                        self.disarm(&shared.events, watcher);
                        return;
                    }

                    if !shared.is_current(generation) {
                        // opened on a connection that failed meanwhile
                        drop(channel);
                        if !self.disarm(&shared.events, watcher) {
                            return;
                        }
                        continue;
                    }

                    self.rearm.deliveries.fetch_add(1, Ordering::SeqCst);
                    (self.on_ready)(channel);
                    return;
                }
                Err(err) => {
                    shared.log(
                        &[TAG_RABBITMQ, TAG_WARNING],
                        json!({
                            "message": "channel unavailable",
                            "address": shared.config.redacted_address(),
                            "error": err.to_string(),
                        }),
                    );

                    // the connection error path owns the registration now
                    if !self.disarm(&shared.events, watcher) {
                        return;
                    }

                    let delay = shared.backoff.recovery_delay();
                    let shutdown = shared.shutdown.clone();
                    drop(connection);
                    drop(shared);

                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Subscribes once to `connection_error` on behalf of this registration.
    fn arm(&self, events: &EventBus) -> SubscriptionId {
        let next = self.clone();
        let id = events.subscribe(Signal::ConnectionError, true, move |_| {
            next.on_connection_error();
        });

        if let Some(stale) = self.rearm.set(id) {
            events.unsubscribe(stale);
        }
        id
    }

    /// Removes the given re-arm subscription if it is still the outstanding one.
    fn disarm(&self, events: &EventBus, watcher: SubscriptionId) -> bool {
        if !self.rearm.clear_if(watcher) {
            return false;
        }
        events.unsubscribe(watcher);
        true
    }

    fn on_connection_error(&self) {
        if self.rearm.is_cancelled() {
            return;
        }

        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        if shared.is_closed() {
            return;
        }

        let next = self.clone();
        let id = shared.events.subscribe(Signal::Connected, true, move |_| {
            next.rearm.slot().take();
            next.clone().start();
        });

        self.rearm.set(id);
    }
}
