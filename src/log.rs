// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Log Sink
//!
//! Lifecycle records are emitted as a list of tags plus structured fields, so
//! applications can route them into their own logging pipeline. The default
//! sink forwards them to `tracing`, picking the level from the tags.

use serde_json::Value;
use tracing::{error, info, warn};

pub const TAG_RABBITMQ: &str = "rabbitmq";
pub const TAG_ERROR: &str = "error";
pub const TAG_WARNING: &str = "warning";
pub const TAG_INFO: &str = "info";

/// Receives lifecycle records from the connection manager.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, tags: &[&str], fields: &Value);
}

/// Forwards lifecycle records to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, tags: &[&str], fields: &Value) {
        let message = fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if tags.contains(&TAG_ERROR) {
            error!(tags = ?tags, fields = %fields, "{}", message);
        } else if tags.contains(&TAG_WARNING) {
            warn!(tags = ?tags, fields = %fields, "{}", message);
        } else {
            info!(tags = ?tags, fields = %fields, "{}", message);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every record for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        records: Mutex<Vec<(Vec<String>, Value)>>,
    }

    impl RecordingSink {
        pub(crate) fn messages(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, fields)| fields.get("message")?.as_str().map(str::to_owned))
                .collect()
        }

        pub(crate) fn count(&self, message: &str) -> usize {
            self.messages().iter().filter(|m| m.as_str() == message).count()
        }

        pub(crate) fn records(&self) -> Vec<(Vec<String>, Value)> {
            self.records.lock().unwrap().clone()
        }
    }

    impl LogSink for RecordingSink {
        fn log(&self, tags: &[&str], fields: &Value) {
            self.records.lock().unwrap().push((
                tags.iter().map(|t| t.to_string()).collect(),
                fields.clone(),
            ));
        }
    }
}
