use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::UpstreamConfig;

/// A single origin server in the pool
///
/// Runtime state lives in atomics so selectors and the forwarder never take
/// a lock. Health transitions publish with a single Release store.
#[derive(Debug)]
pub struct Upstream {
    /// Stable id, used for deterministic tie-breaks
    pub id: usize,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub max_fails: u32,
    pub fail_timeout: Duration,
    pub backup: bool,

    healthy: AtomicBool,
    current_fails: AtomicU32,
    last_fail: RwLock<Option<Instant>>,
    pub active_connections: AtomicU32,
    pub total_requests: AtomicU64,
}

impl Upstream {
    fn new(id: usize, config: &UpstreamConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            address: config.address.clone(),
            port: config.port,
            weight: config.weight.max(1),
            max_fails: config.max_fails,
            fail_timeout: Duration::from_secs(config.fail_timeout),
            backup: config.backup,
            healthy: AtomicBool::new(true),
            current_fails: AtomicU32::new(0),
            last_fail: RwLock::new(None),
            active_connections: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    /// `host:port` key used by the connection pool and probes
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn current_fails(&self) -> u32 {
        self.current_fails.load(Ordering::Acquire)
    }

    /// A request completed against this upstream (it answered, whatever the
    /// status)
    pub fn record_success(&self) {
        self.current_fails.store(0, Ordering::Release);
    }

    /// A request or probe failed. Crossing `max_fails` publishes the
    /// unhealthy transition.
    pub fn record_failure(&self) {
        let fails = self.current_fails.fetch_add(1, Ordering::AcqRel) + 1;
        if let Ok(mut last) = self.last_fail.write() {
            *last = Some(Instant::now());
        }

        if fails >= self.max_fails && self.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                upstream = %self.name,
                fails,
                "upstream marked unhealthy"
            );
        }
    }

    /// A probe succeeded. An unhealthy member recovers only after
    /// `fail_timeout` has elapsed since its last failure.
    pub fn probe_success(&self) {
        if self.is_healthy() {
            self.current_fails.store(0, Ordering::Release);
            return;
        }

        let eligible = self
            .last_fail
            .read()
            .ok()
            .and_then(|last| *last)
            .map(|t| t.elapsed() >= self.fail_timeout)
            .unwrap_or(true);

        if eligible {
            self.current_fails.store(0, Ordering::Release);
            self.healthy.store(true, Ordering::Release);
            info!(upstream = %self.name, "upstream recovered");
        }
    }

    /// A probe failed; unhealthy members stay down and refresh their
    /// fail-timeout clock
    pub fn probe_failure(&self) {
        self.record_failure();
    }

    pub fn begin_request(&self) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_request(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            name: self.name.clone(),
            address: self.authority(),
            healthy: self.is_healthy(),
            backup: self.backup,
            weight: self.weight,
            active_connections: self.active_connections.load(Ordering::Acquire),
            total_requests: self.total_requests.load(Ordering::Acquire),
            current_fails: self.current_fails(),
        }
    }
}

/// Point-in-time view of one member, surfaced via `/status`
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
    pub name: String,
    pub address: String,
    pub healthy: bool,
    pub backup: bool,
    pub weight: u32,
    pub active_connections: u32,
    pub total_requests: u64,
    pub current_fails: u32,
}

/// Owns the pool members. Reads take snapshots; the member list only changes
/// under the write lock during reloads.
pub struct UpstreamPool {
    members: RwLock<Vec<Arc<Upstream>>>,
}

impl UpstreamPool {
    pub fn new(configs: &[UpstreamConfig]) -> Self {
        let members = configs
            .iter()
            .enumerate()
            .map(|(id, c)| Arc::new(Upstream::new(id, c)))
            .collect();

        Self {
            members: RwLock::new(members),
        }
    }

    /// Every member, healthy or not
    pub fn all(&self) -> Vec<Arc<Upstream>> {
        self.members
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Healthy members eligible for selection. Backups appear only when no
    /// primary is healthy.
    pub fn healthy_snapshot(&self) -> Vec<Arc<Upstream>> {
        let members = match self.members.read() {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };

        let primaries: Vec<Arc<Upstream>> = members
            .iter()
            .filter(|u| !u.backup && u.is_healthy())
            .cloned()
            .collect();

        if !primaries.is_empty() {
            return primaries;
        }

        members
            .iter()
            .filter(|u| u.backup && u.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Upstream>> {
        self.members
            .read()
            .ok()?
            .iter()
            .find(|u| u.name == name)
            .cloned()
    }

    /// Replace membership from a new configuration, preserving runtime state
    /// for members whose name and authority are unchanged
    pub fn merge(&self, configs: &[UpstreamConfig]) {
        let mut members = match self.members.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };

        let old = std::mem::take(&mut *members);
        let mut next = Vec::with_capacity(configs.len());

        for (id, config) in configs.iter().enumerate() {
            let authority = format!("{}:{}", config.address, config.port);
            match old
                .iter()
                .find(|u| u.name == config.name && u.authority() == authority)
            {
                Some(existing) => next.push(existing.clone()),
                None => {
                    info!(upstream = %config.name, address = %authority, "upstream added");
                    next.push(Arc::new(Upstream::new(id, config)));
                }
            }
        }

        for dropped in old.iter().filter(|u| {
            !next
                .iter()
                .any(|n| n.name == u.name && n.authority() == u.authority())
        }) {
            info!(upstream = %dropped.name, "upstream removed");
        }

        *members = next;
    }

    pub fn stats(&self) -> Vec<UpstreamStats> {
        self.all().iter().map(|u| u.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
