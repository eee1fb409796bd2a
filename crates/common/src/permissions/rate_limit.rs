use std::collections::HashMap;
use std::fmt::{self, Display};
use std::net::IpAddr;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Buckets beyond this count trigger a sweep of idle (full) buckets.
const MAX_TRACKED_CLIENTS: usize = 4096;

/// Who shares a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitScope {
    /// One bucket for every client.
    Global,
    /// One bucket per client address.
    #[default]
    PerIp,
}

impl FromStr for LimitScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(LimitScope::Global),
            "per-ip" | "ip" => Ok(LimitScope::PerIp),
            other => Err(format!("unknown rate limit scope: {}", other)),
        }
    }
}

impl Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Global => f.write_str("global"),
            LimitScope::PerIp => f.write_str("per-ip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit of {limit} requests per second exceeded")]
pub struct RateLimited {
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled at `requests_per_second`, holding at most that many tokens.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    scope: LimitScope,
    buckets: Mutex<HashMap<Option<IpAddr>, Bucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, scope: LimitScope) -> Self {
        Self {
            limit: requests_per_second.max(1),
            scope,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn scope(&self) -> LimitScope {
        self.scope
    }

    /// Take one token for a request from `client`.
    pub fn check(&self, client: Option<IpAddr>) -> Result<(), RateLimited> {
        let key = match self.scope {
            LimitScope::Global => None,
            LimitScope::PerIp => client,
        };
        let capacity = f64::from(self.limit);
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        if buckets.len() > MAX_TRACKED_CLIENTS {
            buckets.retain(|_, bucket| {
                let refilled = bucket.tokens
                    + now.duration_since(bucket.last_refill).as_secs_f64() * capacity;
                refilled < capacity
            });
        }

        let bucket = buckets.entry(key).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(RateLimited { limit: self.limit })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ip(last: u8) -> Option<IpAddr> {
        Some(IpAddr::from([10, 0, 0, last]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::new(3, LimitScope::Global);
        for _ in 0..3 {
            assert!(limiter.check(ip(1)).is_ok());
        }
        assert_eq!(limiter.check(ip(1)), Err(RateLimited { limit: 3 }));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_scope_shares_bucket() {
        let limiter = RateLimiter::new(2, LimitScope::Global);
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(2)).is_ok());
        assert!(limiter.check(ip(3)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_ip_scope_separates_clients() {
        let limiter = RateLimiter::new(1, LimitScope::PerIp);
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        assert!(limiter.check(ip(2)).is_ok());
    }

    #[test]
    fn test_scope_from_str() {
        assert_eq!("global".parse::<LimitScope>().unwrap(), LimitScope::Global);
        assert_eq!("per-ip".parse::<LimitScope>().unwrap(), LimitScope::PerIp);
        assert!("sometimes".parse::<LimitScope>().is_err());
    }
}
