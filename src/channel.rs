// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Creation
//!
//! This module implements the broker transport on top of `lapin`. It opens
//! named connections to the RabbitMQ server, creates channels on them, and
//! forwards transport failures to the connection manager.

use crate::{
    configs::ConnectionConfig,
    errors::AmqpError,
    transport::{Broker, BrokerConnection, ErrorHook},
};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error};

/// Connects to RabbitMQ with `lapin`.
#[derive(Clone)]
pub struct LapinBroker {
    properties: ConnectionProperties,
}

impl LapinBroker {
    /// Creates a broker transport whose connections carry the configured name.
    ///
    /// # Parameters
    /// * `cfg` - The configuration holding the connection name
    ///
    /// # Returns
    /// A new LapinBroker instance
    pub fn new(cfg: &ConnectionConfig) -> LapinBroker {
        LapinBroker::with_properties(
            ConnectionProperties::default()
                .with_connection_name(LongString::from(cfg.name().to_owned())),
        )
    }

    /// Creates a broker transport with custom `lapin` connection properties.
    pub fn with_properties(properties: ConnectionProperties) -> LapinBroker {
        LapinBroker { properties }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    /// Establishes an AMQP connection.
    ///
    /// # Parameters
    /// * `uri` - The broker URI, including the heartbeat query parameter
    ///
    /// # Returns
    /// The connection on success or AmqpError::ConnectionError on failure
    async fn connect(&self, uri: &str) -> Result<LapinConnection, AmqpError> {
        debug!("creating amqp connection...");

        match Connection::connect(uri, self.properties.clone()).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(LapinConnection { conn })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// An established `lapin` connection.
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    pub fn inner(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = Channel;

    /// Creates a channel on the connection.
    ///
    /// # Returns
    /// The channel on success or AmqpError::ChannelError on failure
    async fn open_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");

        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn on_error(&self, mut hook: ErrorHook) {
        self.conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            hook(AmqpError::ConnectionLost(err.to_string()));
        });
    }
}
