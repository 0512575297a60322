// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Connection Manager
//!
//! This module provides the error type shared by the connection manager, the
//! broker transport and the configuration layer. Only `TooManyRetries` is fatal:
//! every other variant is absorbed by the manager and retried.

use thiserror::Error;

/// Represents errors that can occur while establishing and supervising a
/// RabbitMQ connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker could not be reached on a connect attempt
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// A previously established connection reported a transport failure
    #[error("connection lost `{0}`")]
    ConnectionLost(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The retry budget was exhausted
    #[error("Too many connection attempts: attempt {attempt} exceeds the limit of {max_retries}")]
    TooManyRetries { attempt: u32, max_retries: u32 },

    /// The connection manager was shut down
    #[error("connection manager is shut down")]
    Shutdown,

    /// The connection configuration is unusable
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),
}

impl AmqpError {
    /// Returns true for the only error the manager never recovers from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AmqpError::TooManyRetries { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhausted_budget_is_fatal() {
        assert!(AmqpError::TooManyRetries {
            attempt: 2,
            max_retries: 1
        }
        .is_fatal());
        assert!(!AmqpError::ConnectionError("refused".to_owned()).is_fatal());
        assert!(!AmqpError::ConnectionLost("reset".to_owned()).is_fatal());
        assert!(!AmqpError::ChannelError("closed".to_owned()).is_fatal());
    }

    #[test]
    fn exhausted_budget_message_mentions_too_many() {
        let err = AmqpError::TooManyRetries {
            attempt: 4,
            max_retries: 3,
        };
        assert!(err.to_string().starts_with("Too many"));
    }
}
