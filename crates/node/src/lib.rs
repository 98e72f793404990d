//! Node tooling for virtual maps.
//!
//! Wraps the engine and reconnect crates into the operations a node runs
//! against snapshot directories: inspecting and verifying them, serving a
//! snapshot to lagging peers over TCP, and catching a snapshot up from a
//! peer.

pub mod commands;
mod config;
mod rate_limiter;

pub use commands::SnapshotSummary;
pub use config::NodeConfig;
pub use rate_limiter::{RateLimitConfig, SessionRateLimiter};
