// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Delay Policy
//!
//! Cold failures wait `initial + initial * attempt * (0.5 + U[0,1))`, capped at
//! the configured maximum. The jitter term spreads simultaneous clients
//! reconnecting to the same broker. After a live disconnect the broker was
//! reachable moments ago, so the recovery delay is only `initial * U[0,1)`.

use crate::configs::ConnectionConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff { initial, max }
    }

    pub fn from_config(cfg: &ConnectionConfig) -> Backoff {
        Backoff::new(cfg.initial_backoff_delay(), cfg.max_backoff_delay())
    }

    /// Delay before retrying after `attempt` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::thread_rng().gen::<f64>())
    }

    /// Delay before reconnecting after a live connection was lost.
    pub fn recovery_delay(&self) -> Duration {
        self.recovery_delay_with(rand::thread_rng().gen::<f64>())
    }

    pub(crate) fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let initial = self.initial.as_secs_f64();
        let secs = initial + initial * f64::from(attempt) * (0.5 + sample);

        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub(crate) fn recovery_delay_with(&self, sample: f64) -> Duration {
        self.initial.mul_f64(sample).min(self.max)
    }
}
