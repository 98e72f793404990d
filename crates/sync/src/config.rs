//! Reconnect configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and batching for a reconnect session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// How long the learner waits for the teacher's next message.
    #[serde(with = "vmap_types::duration_ms")]
    pub async_stream_timeout: Duration,

    /// How long the teacher waits for the learner to answer a message.
    #[serde(with = "vmap_types::duration_ms")]
    pub max_ack_delay: Duration,

    /// Wall-clock limit for a whole session.
    #[serde(with = "vmap_types::duration_ms")]
    pub reconnect_budget: Duration,

    /// Upper bound on queries, and separately on leaves, in one round.
    pub max_queries_per_round: usize,

    /// Records the learner buffers before writing them to its data source.
    pub learner_flush_threshold: usize,

    /// Check every received leaf against the hash the teacher sent for its path.
    pub validate_leaf_hashes: bool,

    /// Largest encoded frame either side accepts.
    pub max_frame_size: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            async_stream_timeout: Duration::from_secs(60),
            max_ack_delay: Duration::from_secs(10),
            reconnect_budget: Duration::from_secs(600),
            max_queries_per_round: 1024,
            learner_flush_threshold: 50_000,
            validate_leaf_hashes: true,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl ReconnectConfig {
    pub fn with_async_stream_timeout(mut self, timeout: Duration) -> Self {
        self.async_stream_timeout = timeout;
        self
    }

    pub fn with_max_ack_delay(mut self, delay: Duration) -> Self {
        self.max_ack_delay = delay;
        self
    }

    pub fn with_reconnect_budget(mut self, budget: Duration) -> Self {
        self.reconnect_budget = budget;
        self
    }

    pub fn with_max_queries_per_round(mut self, max: usize) -> Self {
        self.max_queries_per_round = max.max(1);
        self
    }

    pub fn with_learner_flush_threshold(mut self, threshold: usize) -> Self {
        self.learner_flush_threshold = threshold;
        self
    }

    pub fn with_validate_leaf_hashes(mut self, validate: bool) -> Self {
        self.validate_leaf_hashes = validate;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}
