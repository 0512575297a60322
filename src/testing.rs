// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the lifecycle tests.

use crate::{
    errors::AmqpError,
    transport::{Broker, BrokerConnection, ErrorHook},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FakeChannel {
    pub(crate) id: u64,
    pub(crate) connection: u32,
}

#[derive(Default)]
struct FakeState {
    unreachable: AtomicBool,
    connects: AtomicU32,
    established: AtomicU32,
    channels: AtomicU64,
    failing_channels: AtomicU32,
    fail_on_install: AtomicU32,
    hooks: Mutex<Vec<(u32, ErrorHook)>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<FakeState>,
}

impl FakeBroker {
    pub(crate) fn reachable() -> FakeBroker {
        FakeBroker::default()
    }

    pub(crate) fn unreachable() -> FakeBroker {
        let broker = FakeBroker::default();
        broker.set_reachable(false);
        broker
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Connect attempts so far, successful or not.
    pub(crate) fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn established(&self) -> u32 {
        self.state.established.load(Ordering::SeqCst)
    }

    /// Makes the next `count` channel opens fail.
    pub(crate) fn fail_channels(&self, count: u32) {
        self.state.failing_channels.store(count, Ordering::SeqCst);
    }

    /// Makes the connection with the given number report a failure as soon
    /// as its error hook is installed.
    pub(crate) fn fail_on_install(&self, number: u32) {
        self.state.fail_on_install.store(number, Ordering::SeqCst);
    }

    /// Reports a transport failure on the most recent connection.
    pub(crate) fn break_connection(&self, reason: &str) {
        let mut hooks = self.state.hooks.lock().unwrap();
        if let Some((_, hook)) = hooks.last_mut() {
            hook(AmqpError::ConnectionLost(reason.to_owned()));
        }
    }

    /// Reports a transport failure on the connection with the given number.
    pub(crate) fn break_connection_number(&self, number: u32, reason: &str) {
        let mut hooks = self.state.hooks.lock().unwrap();
        for (connection, hook) in hooks.iter_mut() {
            if *connection == number {
                hook(AmqpError::ConnectionLost(reason.to_owned()));
            }
        }
    }
}

pub(crate) struct FakeConnection {
    number: u32,
    state: Arc<FakeState>,
}

#[async_trait]
impl Broker for FakeBroker {
    type Connection = FakeConnection;

    async fn connect(&self, uri: &str) -> Result<FakeConnection, AmqpError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if self.state.unreachable.load(Ordering::SeqCst) || uri.starts_with("amqp://nohost") {
            return Err(AmqpError::ConnectionError(format!("{} is unreachable", uri)));
        }

        let number = self.state.established.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection {
            number,
            state: self.state.clone(),
        })
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn open_channel(&self) -> Result<FakeChannel, AmqpError> {
        let failing = self.state.failing_channels.load(Ordering::SeqCst);
        if failing > 0 {
            self.state
                .failing_channels
                .store(failing - 1, Ordering::SeqCst);
            return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
        }

        Ok(FakeChannel {
            id: self.state.channels.fetch_add(1, Ordering::SeqCst) + 1,
            connection: self.number,
        })
    }

    fn on_error(&self, mut hook: ErrorHook) {
        if self.state.fail_on_install.load(Ordering::SeqCst) == self.number {
            hook(AmqpError::ConnectionLost("closed during handshake".to_owned()));
        }
        self.state.hooks.lock().unwrap().push((self.number, hook));
    }
}
