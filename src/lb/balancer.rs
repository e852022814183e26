use rand::Rng;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::LoadBalancingMethod;
use crate::lb::upstream::Upstream;

/// Selects one member from a healthy snapshot
///
/// Total over any non-empty snapshot; the pipeline handles the empty case
/// as a 502 before calling in.
pub struct LoadBalancer {
    method: LoadBalancingMethod,
    counter: AtomicU64,
}

impl LoadBalancer {
    pub fn new(method: LoadBalancingMethod) -> Self {
        Self {
            method,
            counter: AtomicU64::new(0),
        }
    }

    pub fn method(&self) -> LoadBalancingMethod {
        self.method
    }

    /// Pick a member. The snapshot must be the same one whose counters are
    /// inspected, so least-connections reads are consistent.
    pub fn select(&self, snapshot: &[Arc<Upstream>], client: IpAddr) -> Option<Arc<Upstream>> {
        if snapshot.is_empty() {
            return None;
        }

        let index = match self.method {
            LoadBalancingMethod::RoundRobin => self.select_round_robin(snapshot),
            LoadBalancingMethod::LeastConnections => self.select_least_connections(snapshot),
            LoadBalancingMethod::IpHash => self.select_ip_hash(snapshot, client),
            LoadBalancingMethod::Random => self.select_random(snapshot),
            LoadBalancingMethod::Weighted => self.select_weighted(snapshot),
        };

        snapshot.get(index).cloned()
    }

    fn select_round_robin(&self, snapshot: &[Arc<Upstream>]) -> usize {
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        (ticket % snapshot.len() as u64) as usize
    }

    /// Fewest active connections; ties break toward the lowest member id
    fn select_least_connections(&self, snapshot: &[Arc<Upstream>]) -> usize {
        snapshot
            .iter()
            .enumerate()
            .min_by_key(|(_, u)| (u.active_connections.load(Ordering::Acquire), u.id))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    /// Stable hash of the client address; same client maps to the same
    /// member for a fixed snapshot
    fn select_ip_hash(&self, snapshot: &[Arc<Upstream>], client: IpAddr) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        client.hash(&mut hasher);
        (hasher.finish() % snapshot.len() as u64) as usize
    }

    fn select_random(&self, snapshot: &[Arc<Upstream>]) -> usize {
        rand::thread_rng().gen_range(0..snapshot.len())
    }

    /// Cumulative-weight random draw: P(u) = weight(u) / sum(weights)
    fn select_weighted(&self, snapshot: &[Arc<Upstream>]) -> usize {
        let total: u64 = snapshot.iter().map(|u| u.weight as u64).sum();
        if total == 0 {
            return self.select_round_robin(snapshot);
        }

        let mut target = rand::thread_rng().gen_range(0..total);
        for (idx, upstream) in snapshot.iter().enumerate() {
            let weight = upstream.weight as u64;
            if target < weight {
                return idx;
            }
            target -= weight;
        }

        snapshot.len() - 1
    }
}
