// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Boundary
//!
//! The connection manager drives the broker through these two traits only.
//! `LapinBroker` in the `channel` module is the production implementation.

use crate::errors::AmqpError;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Called by a connection when its transport fails.
pub type ErrorHook = Box<dyn FnMut(AmqpError) + Send + 'static>;

/// An established session with the broker, from which channels are opened.
#[cfg_attr(test, automock(type Channel = u64;))]
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: Send + 'static;

    /// Opens a new channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel, AmqpError>;

    /// Installs the hook invoked when the underlying transport fails.
    ///
    /// Implementations may invoke the hook more than once.
    fn on_error(&self, hook: ErrorHook);
}

/// Opens connections to a broker.
#[cfg_attr(test, automock(type Connection = MockBrokerConnection;))]
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Connects to the broker at the given URI.
    async fn connect(&self, uri: &str) -> Result<Self::Connection, AmqpError>;
}

/// The channel type produced by a broker's connections.
pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;
