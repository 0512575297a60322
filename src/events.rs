// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle Signals
//!
//! This module provides the `EventBus` used by the connection manager to
//! announce lifecycle changes. Subscribers register a handler for one signal,
//! either persistent or one-shot, and receive every publication of that signal
//! in registration order.
//!
//! Handlers run synchronously inside `publish` and must not panic: the bus does
//! not catch unwinding handlers.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::oneshot;
use tracing::trace;

/// The lifecycle signals carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A connection to the broker was established
    Connected,
    /// An established connection reported a failure
    ConnectionError,
    /// A connect attempt failed
    ConnectFailed,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Connected => write!(f, "connected"),
            Signal::ConnectionError => write!(f, "connection_error"),
            Signal::ConnectFailed => write!(f, "connect_failed"),
        }
    }
}

/// What a handler receives when a signal is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub signal: Signal,
    pub detail: Option<String>,
}

/// Identifies a registration so it can be removed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Handler = Arc<dyn Fn(&Notification) + Send + Sync + 'static>;

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

/// Multi-subscriber notification bus for connection lifecycle signals.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<Signal, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Arc<EventBus> {
        Arc::new(EventBus::default())
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Signal, Vec<Subscription>>> {
        // handlers never run under the lock, so a poisoned registry is still consistent
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a handler for a signal.
    ///
    /// # Parameters
    /// * `signal` - The signal to listen to
    /// * `once` - Removes the handler after its first invocation when true
    /// * `handler` - Invoked with the published notification
    ///
    /// # Returns
    /// The id of the new subscription
    pub fn subscribe<F>(&self, signal: Signal, once: bool, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.registry().entry(signal).or_default().push(Subscription {
            id,
            once,
            handler: Arc::new(handler),
        });

        trace!(signal = %signal, once, "subscribed");
        id
    }

    /// Removes a subscription.
    ///
    /// # Returns
    /// true if the subscription was still registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();

        for subscriptions in registry.values_mut() {
            if let Some(pos) = subscriptions.iter().position(|s| s.id == id) {
                subscriptions.remove(pos);
                return true;
            }
        }

        false
    }

    /// Publishes a signal to every handler registered for it.
    ///
    /// One-shot handlers are dropped from the registry before any handler runs,
    /// so handlers may subscribe again from within their own invocation.
    pub fn publish(&self, signal: Signal, detail: Option<String>) {
        let handlers: Vec<Handler> = {
            let mut registry = self.registry();
            let Some(subscriptions) = registry.get_mut(&signal) else {
                return;
            };

            let handlers = subscriptions.iter().map(|s| s.handler.clone()).collect();
            subscriptions.retain(|s| !s.once);
            handlers
        };

        trace!(signal = %signal, handlers = handlers.len(), "publishing");

        let notification = Notification { signal, detail };
        for handler in handlers {
            handler(&notification);
        }
    }

    /// Returns how many handlers are registered for a signal.
    pub fn listener_count(&self, signal: Signal) -> usize {
        self.registry().get(&signal).map_or(0, Vec::len)
    }

    /// Waits for the next publication of a signal.
    ///
    /// The one-shot subscription is registered when this method is called,
    /// not when the returned future is first polled.
    pub fn next(&self, signal: Signal) -> impl std::future::Future<Output = Option<Notification>> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));

        self.subscribe(signal, true, move |notification| {
            let sender = tx.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(notification.clone());
            }
        });

        async move { rx.await.ok() }
    }
}
