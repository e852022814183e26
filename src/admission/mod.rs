//! Admission control
//!
//! Every request passes here before routing: blocked-client lookup, static
//! allow/deny lists, burst windows, then the global and per-client token
//! buckets. Buckets refill lazily on access; each bucket lives in one shard
//! slot of a concurrent map, so a refill computed against timestamp `t` can
//! never be replayed against an earlier one.

pub mod burst;

pub use burst::{BurstTracker, BurstViolation};

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{DdosConfig, RateLimitConfig};

/// Lazy-refill token bucket. `0 <= tokens <= capacity` always holds.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_minute: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_minute: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_minute: refill_per_minute as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let refilled = elapsed.as_secs_f64() * self.refill_per_minute / 60.0;
        self.tokens = (self.tokens + refilled).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token; returns false when the bucket is empty
    pub fn try_consume(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available
    pub fn remaining(&self) -> u32 {
        self.tokens as u32
    }

    /// Projected wait until one token is available, rounded up to a second
    pub fn retry_after(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - self.tokens;
        let seconds = (deficit * 60.0 / self.refill_per_minute).ceil();
        Duration::from_secs(seconds.max(1.0) as u64)
    }
}

/// A client barred from admission until `unblock_at`
#[derive(Debug, Clone)]
pub struct BlockedClient {
    pub blocked_at: Instant,
    pub unblock_at: Instant,
    pub reason: String,
}

#[derive(Debug)]
struct ClientState {
    bucket: TokenBucket,
    violations: u32,
    last_seen: Instant,
}

/// The admission verdict for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    /// Seconds the client should wait before retrying; `None` means the
    /// denial is not time-bounded (blacklist)
    pub retry_after: Option<Duration>,
    /// Tokens left in the client's bucket after this request
    pub remaining: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Allowed,
    Whitelisted,
    Blocked,
    Blacklisted,
    GlobalLimit,
    RateLimited,
    RequestTooLarge,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "allowed",
            DecisionReason::Whitelisted => "whitelisted",
            DecisionReason::Blocked => "blocked",
            DecisionReason::Blacklisted => "blacklisted",
            DecisionReason::GlobalLimit => "global_limit",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::RequestTooLarge => "request_too_large",
        }
    }
}

impl Decision {
    fn allow(remaining: Option<u32>) -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Allowed,
            retry_after: None,
            remaining,
        }
    }

    fn deny(reason: DecisionReason, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after,
            remaining: Some(0),
        }
    }
}

/// Token-bucket rate limiting plus burst-rate DDoS tracking
pub struct AdmissionController {
    config: RateLimitConfig,
    whitelist: Vec<IpAddr>,
    blacklist: Vec<IpAddr>,
    global_bucket: Mutex<TokenBucket>,
    clients: DashMap<IpAddr, ClientState>,
    blocked: DashMap<IpAddr, BlockedClient>,
    burst: BurstTracker,
}

impl AdmissionController {
    pub fn new(config: RateLimitConfig, ddos: DdosConfig) -> Self {
        let parse_list = |raw: &[String]| -> Vec<IpAddr> {
            raw.iter()
                .filter_map(|s| match s.parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(entry = %s, "ignoring unparseable address in ip list");
                        None
                    }
                })
                .collect()
        };

        let whitelist = parse_list(&config.whitelist);
        let blacklist = parse_list(&config.blacklist);
        let global_bucket = Mutex::new(TokenBucket::new(
            config.global_burst,
            config.global_requests_per_minute,
        ));

        Self {
            config,
            whitelist,
            blacklist,
            global_bucket,
            clients: DashMap::new(),
            blocked: DashMap::new(),
            burst: BurstTracker::new(ddos),
        }
    }

    pub fn burst(&self) -> &BurstTracker {
        &self.burst
    }

    /// Admission check for one request
    pub fn check(&self, client: IpAddr, request_size: u64) -> Decision {
        if !self.config.enabled {
            return Decision::allow(None);
        }

        // Blocked clients are denied first; expired blocks are removed lazily.
        if let Some(remaining) = self.blocked_remaining(client) {
            return Decision::deny(DecisionReason::Blocked, Some(remaining));
        }

        // Allowlisted clients bypass every limit, including burst windows.
        if self.whitelist.contains(&client) {
            return Decision {
                allowed: true,
                reason: DecisionReason::Whitelisted,
                retry_after: None,
                remaining: None,
            };
        }

        if self.blacklist.contains(&client) {
            return Decision::deny(DecisionReason::Blacklisted, None);
        }

        // Burst windows run ahead of the buckets.
        if let Some(violation) = self.burst.record_packet(client) {
            self.block(client, violation.as_str());
            return Decision::deny(
                DecisionReason::Blocked,
                Some(Duration::from_secs(self.config.block_duration)),
            );
        }

        {
            let mut global = self
                .global_bucket
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !global.try_consume() {
                debug!(client = %client, "global rate limit exceeded");
                return Decision::deny(DecisionReason::GlobalLimit, Some(global.retry_after()));
            }
        }

        let now = Instant::now();
        let mut state = self.clients.entry(client).or_insert_with(|| ClientState {
            bucket: TokenBucket::new(self.config.burst, self.config.requests_per_minute),
            violations: 0,
            last_seen: now,
        });
        state.last_seen = now;

        if !state.bucket.try_consume() {
            state.violations += 1;
            let retry_after = state.bucket.retry_after();
            let violations = state.violations;
            drop(state);

            if self.config.auto_block_enabled && violations >= self.config.auto_block_threshold {
                self.block(client, "rate_limit");
                return Decision::deny(
                    DecisionReason::Blocked,
                    Some(Duration::from_secs(self.config.block_duration)),
                );
            }

            return Decision::deny(DecisionReason::RateLimited, Some(retry_after));
        }

        let remaining = state.bucket.remaining();
        drop(state);

        if request_size > self.config.max_request_size {
            return Decision::deny(DecisionReason::RequestTooLarge, Some(Duration::ZERO));
        }

        Decision::allow(Some(remaining))
    }

    /// Connection-level burst accounting, called at accept time. A violating
    /// client is blocked and the connection should be closed.
    pub fn admit_connection(&self, client: IpAddr) -> bool {
        if self.whitelist.contains(&client) {
            return true;
        }

        match self.burst.record_connection(client) {
            None => true,
            Some(violation) => {
                self.block(client, violation.as_str());
                false
            }
        }
    }

    pub fn connection_closed(&self, client: IpAddr) {
        self.burst.record_disconnect(client);
    }

    fn blocked_remaining(&self, client: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        if let Some(entry) = self.blocked.get(&client) {
            if now < entry.unblock_at {
                return Some(entry.unblock_at.duration_since(now));
            }
        }
        // Past unblock time: remove outside the read guard.
        if self.blocked.remove_if(&client, |_, e| now >= e.unblock_at).is_some() {
            info!(client = %client, "client unblocked");
        }
        None
    }

    fn block(&self, client: IpAddr, reason: &str) {
        let now = Instant::now();
        let duration = Duration::from_secs(self.config.block_duration);
        self.blocked.insert(
            client,
            BlockedClient {
                blocked_at: now,
                unblock_at: now + duration,
                reason: reason.to_string(),
            },
        );
        warn!(client = %client, reason = %reason, duration_secs = self.config.block_duration, "client blocked");
    }

    /// Remove a block ahead of its expiry
    pub fn unblock(&self, client: IpAddr) -> bool {
        self.blocked.remove(&client).is_some()
    }

    /// Periodic sweep: expired blocks, stale burst windows, idle buckets
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.blocked.retain(|client, entry| {
            let keep = now < entry.unblock_at;
            if !keep {
                debug!(client = %client, "expired block swept");
            }
            keep
        });

        self.burst.cleanup();

        // Buckets untouched for an hour have fully refilled; drop them.
        self.clients
            .retain(|_, state| now.duration_since(state.last_seen) < Duration::from_secs(3600));
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_config(rpm: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            requests_per_minute: rpm,
            burst,
            global_requests_per_minute: 100_000,
            global_burst: 100_000,
            max_request_size: 1024 * 1024,
            auto_block_enabled: false,
            auto_block_threshold: 1,
            block_duration: 5,
            whitelist: vec![],
            blacklist: vec![],
        }
    }

    fn ddos_disabled() -> DdosConfig {
        DdosConfig {
            enabled: false,
            max_connections_per_ip: 100,
            connection_rate_limit: 60,
            packet_rate_limit: 1000,
            window_size: 60,
        }
    }

    fn ip(last: u8) -> IpAddr {
        format!("192.168.1.{}", last).parse().unwrap()
    }

    #[test]
    fn test_token_bucket_bounds() {
        let mut bucket = TokenBucket::new(3, 60);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        assert_eq!(bucket.remaining(), 0);
        assert!(bucket.retry_after() >= Duration::from_secs(1));
    }

    #[test]
    fn test_bucket_does_not_exceed_capacity() {
        let mut bucket = TokenBucket::new(2, 6000);
        std::thread::sleep(Duration::from_millis(50));
        bucket.refill(Instant::now());
        assert!(bucket.tokens <= 2.0);
    }

    #[test]
    fn test_basic_allow() {
        let admission = AdmissionController::new(rate_config(60, 10), ddos_disabled());
        let decision = admission.check(ip(1), 0);
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Allowed);
        assert_eq!(decision.remaining, Some(9));
    }

    #[test]
    fn test_burst_exhaustion_returns_429_material() {
        let admission = AdmissionController::new(rate_config(60, 10), ddos_disabled());
        let client = ip(2);

        for i in 0..10 {
            let decision = admission.check(client, 0);
            assert!(decision.allowed, "request {} should pass", i);
        }

        let decision = admission.check(client, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::RateLimited);
        assert!(decision.retry_after.unwrap() >= Duration::from_secs(1));

        let decision = admission.check(client, 0);
        assert!(!decision.allowed);
    }

    #[test]
    fn test_clients_have_independent_buckets() {
        let admission = AdmissionController::new(rate_config(60, 2), ddos_disabled());

        assert!(admission.check(ip(3), 0).allowed);
        assert!(admission.check(ip(3), 0).allowed);
        assert!(!admission.check(ip(3), 0).allowed);

        assert!(admission.check(ip(4), 0).allowed);
    }

    #[test]
    fn test_whitelist_bypasses_buckets() {
        let mut config = rate_config(60, 1);
        config.whitelist = vec!["192.168.1.5".to_string()];
        let admission = AdmissionController::new(config, ddos_disabled());

        for _ in 0..20 {
            let decision = admission.check(ip(5), 0);
            assert!(decision.allowed);
            assert_eq!(decision.reason, DecisionReason::Whitelisted);
        }
    }

    #[test]
    fn test_blacklist_denies() {
        let mut config = rate_config(60, 10);
        config.blacklist = vec!["192.168.1.6".to_string()];
        let admission = AdmissionController::new(config, ddos_disabled());

        let decision = admission.check(ip(6), 0);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Blacklisted);
        assert_eq!(decision.retry_after, None);
    }

    #[test]
    fn test_auto_block_and_lazy_unblock() {
        let mut config = rate_config(60, 1);
        config.auto_block_enabled = true;
        config.block_duration = 1;
        let admission = AdmissionController::new(config, ddos_disabled());
        let client = ip(7);

        assert!(admission.check(client, 0).allowed);

        let decision = admission.check(client, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Blocked);
        assert!(decision.retry_after.unwrap() <= Duration::from_secs(1));
        assert_eq!(admission.blocked_count(), 1);

        // Still blocked on the next request.
        let decision = admission.check(client, 0);
        assert_eq!(decision.reason, DecisionReason::Blocked);

        // After expiry the client re-enters normal admission.
        std::thread::sleep(Duration::from_millis(1100));
        let decision = admission.check(client, 0);
        assert_ne!(decision.reason, DecisionReason::Blocked);
    }

    #[test]
    fn test_request_too_large() {
        let mut config = rate_config(60, 10);
        config.max_request_size = 100;
        let admission = AdmissionController::new(config, ddos_disabled());

        let decision = admission.check(ip(8), 101);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::RequestTooLarge);
        assert_eq!(decision.retry_after, Some(Duration::ZERO));
    }

    #[test]
    fn test_global_limit() {
        let mut config = rate_config(1000, 1000);
        config.global_burst = 2;
        config.global_requests_per_minute = 60;
        let admission = AdmissionController::new(config, ddos_disabled());

        assert!(admission.check(ip(9), 0).allowed);
        assert!(admission.check(ip(10), 0).allowed);

        let decision = admission.check(ip(11), 0);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::GlobalLimit);
        assert!(decision.retry_after.is_some());
    }

    #[test]
    fn test_disabled_admission_allows_all() {
        let mut config = rate_config(1, 1);
        config.enabled = false;
        let admission = AdmissionController::new(config, ddos_disabled());

        for _ in 0..100 {
            assert!(admission.check(ip(12), u64::MAX).allowed);
        }
    }

    #[test]
    fn test_cleanup_sweeps_expired_blocks() {
        let mut config = rate_config(60, 1);
        config.auto_block_enabled = true;
        config.block_duration = 0;
        let admission = AdmissionController::new(config, ddos_disabled());
        let client = ip(13);

        admission.check(client, 0);
        admission.check(client, 0);

        admission.cleanup();
        assert_eq!(admission.blocked_count(), 0);
    }

    #[test]
    fn test_packet_flood_blocks_client() {
        let config = rate_config(10_000, 10_000);
        let ddos = DdosConfig {
            enabled: true,
            max_connections_per_ip: 100,
            connection_rate_limit: 1000,
            packet_rate_limit: 3,
            window_size: 60,
        };
        let admission = AdmissionController::new(config, ddos);
        let client = ip(14);

        for _ in 0..3 {
            assert!(admission.check(client, 0).allowed);
        }

        let decision = admission.check(client, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Blocked);
        assert_eq!(admission.blocked_count(), 1);
    }
}
