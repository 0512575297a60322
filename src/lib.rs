// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod backoff;

#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod errors;
pub mod events;
pub mod log;
pub mod manager;
pub mod transport;

pub use backoff::Backoff;
pub use channel::{LapinBroker, LapinConnection};
pub use configs::ConnectionConfig;
pub use errors::AmqpError;
pub use events::{EventBus, Notification, Signal, SubscriptionId};
pub use log::{LogSink, TracingSink};
pub use manager::{ChannelRegistration, ConnectionManager, ConnectionStatus};
pub use transport::{Broker, BrokerConnection, ChannelOf, ErrorHook};
