//! Per-peer rate limiting for inbound reconnect sessions.
//!
//! Uses a token bucket per peer address. Trusted peers get higher limits
//! than unknown ones.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Configuration for rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sessions per second a trusted peer may open.
    pub trusted_sessions_per_sec: u32,
    /// Bucket capacity for trusted peers.
    pub trusted_burst: u32,
    /// Sessions per second an unknown peer may open.
    pub unknown_sessions_per_sec: u32,
    /// Bucket capacity for unknown peers.
    pub unknown_burst: u32,
    /// How long to track a peer after its last session.
    #[serde(with = "vmap_types::duration_ms")]
    pub peer_ttl: Duration,
    /// Addresses that get the trusted limits.
    pub trusted_peers: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            trusted_sessions_per_sec: 10,
            trusted_burst: 20,
            // A full reconnect is expensive to serve.
            unknown_sessions_per_sec: 1,
            unknown_burst: 2,
            peer_ttl: Duration::from_secs(300),
            trusted_peers: Vec::new(),
        }
    }
}

/// Token bucket state for a single peer.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_update: Instant,
    /// Last session attempt, for cleanup.
    last_request: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            last_update: now,
            last_request: now,
        }
    }

    /// Try to consume one token. Returns true if allowed.
    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
        self.last_request = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_request) > ttl
    }
}

/// Per-peer rate limiter using token buckets.
#[derive(Debug)]
pub struct SessionRateLimiter {
    config: RateLimitConfig,
    buckets: HashMap<IpAddr, TokenBucket>,
    last_cleanup: Instant,
}

impl SessionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: HashMap::new(),
            last_cleanup: Instant::now(),
        }
    }

    /// Whether `peer` may open another session now.
    pub fn check_session(&mut self, peer: IpAddr) -> bool {
        self.check_session_at(peer, Instant::now())
    }

    fn check_session_at(&mut self, peer: IpAddr, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_cleanup) > Duration::from_secs(60) {
            self.cleanup(now);
        }

        let config = &self.config;
        let bucket = self.buckets.entry(peer).or_insert_with(|| {
            if config.trusted_peers.contains(&peer) {
                TokenBucket::new(config.trusted_burst, config.trusted_sessions_per_sec)
            } else {
                TokenBucket::new(config.unknown_burst, config.unknown_sessions_per_sec)
            }
        });
        bucket.try_consume(now)
    }

    /// Drop peers that have been quiet for longer than the TTL.
    fn cleanup(&mut self, now: Instant) {
        let ttl = self.config.peer_ttl;
        self.buckets.retain(|_, bucket| !bucket.is_stale(now, ttl));
        self.last_cleanup = now;
    }

    pub fn tracked_peer_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            trusted_sessions_per_sec: 10,
            trusted_burst: 5,
            unknown_sessions_per_sec: 1,
            unknown_burst: 2,
            peer_ttl: Duration::from_secs(60),
            trusted_peers: vec![peer(1)],
        }
    }

    #[test]
    fn test_burst_then_limited() {
        let mut limiter = SessionRateLimiter::new(config());
        let now = Instant::now();
        assert!(limiter.check_session_at(peer(2), now));
        assert!(limiter.check_session_at(peer(2), now));
        assert!(!limiter.check_session_at(peer(2), now), "burst exhausted");
    }

    #[test]
    fn test_trusted_peer_higher_limit() {
        let mut limiter = SessionRateLimiter::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_session_at(peer(1), now));
        }
        assert!(!limiter.check_session_at(peer(1), now));
    }

    #[test]
    fn test_tokens_refill() {
        let mut limiter = SessionRateLimiter::new(config());
        let now = Instant::now();
        assert!(limiter.check_session_at(peer(2), now));
        assert!(limiter.check_session_at(peer(2), now));
        assert!(!limiter.check_session_at(peer(2), now));
        assert!(limiter.check_session_at(peer(2), now + Duration::from_millis(1100)));
    }

    #[test]
    fn test_peers_are_independent() {
        let mut limiter = SessionRateLimiter::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            limiter.check_session_at(peer(2), now);
        }
        assert!(limiter.check_session_at(peer(3), now));
        assert_eq!(limiter.tracked_peer_count(), 2);
    }

    #[test]
    fn test_stale_peers_cleaned_up() {
        let mut limiter = SessionRateLimiter::new(config());
        let now = Instant::now();
        limiter.check_session_at(peer(2), now);
        limiter.check_session_at(peer(3), now + Duration::from_secs(120));
        assert_eq!(limiter.tracked_peer_count(), 1);
    }
}
