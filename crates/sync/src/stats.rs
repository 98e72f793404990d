//! Reconnect session statistics.

use std::time::Duration;

/// Counters for one reconnect session, as seen by one side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectStats {
    /// Lessons/answers round trips.
    pub rounds: u64,
    /// Node hashes the teacher put up for comparison.
    pub queries_sent: u64,
    /// Leaf records the teacher sent.
    pub leaves_sent: u64,
    /// Leaf records the learner accepted.
    pub leaves_received: u64,
    /// Queried nodes the learner did not already have.
    pub mismatched: u64,
    /// Learner leaves deleted because the teacher no longer has them there.
    pub stale_leaves_removed: u64,
    /// Writes the learner made to its data source.
    pub flushes: u64,
    /// Wall-clock time of the session.
    pub elapsed: Duration,
}
