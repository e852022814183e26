//! Service composition
//!
//! [`Services`] wires the data-plane components together and owns the reload
//! boundary: the routing table, admission controller, balancer, static
//! server, and forwarder are bundled into an immutable [`State`] swapped
//! wholesale behind a short-held lock. In-flight requests keep draining
//! against the `Arc` they snapshotted. The upstream pool, connection pool,
//! and metrics persist across reloads; the pool merges membership by name so
//! health state survives.

use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::lb::{LoadBalancer, UpstreamPool};
use crate::metrics::Metrics;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::Forwarder;
use crate::router::RouteTable;
use crate::static_files::StaticFileServer;

/// Configuration-derived components, immutable once built
pub struct State {
    pub config: Config,
    pub router: RouteTable,
    pub admission: AdmissionController,
    pub balancer: LoadBalancer,
    pub static_files: StaticFileServer,
    pub forwarder: Forwarder,
}

impl State {
    fn build(config: Config, connections: Arc<ConnectionPool>) -> Self {
        let router = RouteTable::from_config(&config);
        let admission = AdmissionController::new(
            config.security.rate_limiting.clone(),
            config.security.ddos_protection.clone(),
        );
        let balancer = LoadBalancer::new(config.proxy.load_balancing);
        let static_files = StaticFileServer::new(
            config.static_files.clone(),
            config.security.headers.clone(),
        );
        let forwarder = Forwarder::new(connections, config.proxy.request_timeout());

        Self {
            config,
            router,
            admission,
            balancer,
            static_files,
            forwarder,
        }
    }
}

/// The data plane handed to the server and to tests
pub struct Services {
    state: RwLock<Arc<State>>,
    pub upstreams: Arc<UpstreamPool>,
    pub connections: Arc<ConnectionPool>,
    pub metrics: Arc<Metrics>,
}

impl Services {
    pub fn new(config: Config) -> Self {
        let connections = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_key: config.proxy.max_idle_per_upstream,
            max_idle: config.proxy.idle_timeout(),
            connect_timeout: config.proxy.connect_timeout(),
        }));
        let upstreams = Arc::new(UpstreamPool::new(&config.proxy.upstreams));
        let state = State::build(config, connections.clone());

        Self {
            state: RwLock::new(Arc::new(state)),
            upstreams,
            connections,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Snapshot the current state; the snapshot stays valid for the whole
    /// request even if a reload lands mid-flight
    pub fn state(&self) -> Arc<State> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply a validated configuration. A failed build leaves the previous
    /// state untouched; upstream membership merges by name.
    pub fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;

        self.upstreams.merge(&config.proxy.upstreams);
        let state = Arc::new(State::build(config, self.connections.clone()));

        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;

        info!("configuration reloaded");
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.state().config.server.shutdown_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancingMethod, UpstreamConfig};

    fn proxy_config() -> Config {
        let mut config = Config::default();
        config.proxy.enabled = true;
        config.proxy.upstreams = vec![UpstreamConfig {
            name: "a".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9001,
            weight: 1,
            max_fails: 2,
            fail_timeout: 30,
            backup: false,
        }];
        config
    }

    #[test]
    fn test_reload_swaps_state() {
        let services = Services::new(proxy_config());
        assert_eq!(
            services.state().config.proxy.load_balancing,
            LoadBalancingMethod::RoundRobin
        );

        let mut next = proxy_config();
        next.proxy.load_balancing = LoadBalancingMethod::IpHash;
        services.reload(next).unwrap();

        assert_eq!(
            services.state().config.proxy.load_balancing,
            LoadBalancingMethod::IpHash
        );
    }

    #[test]
    fn test_reload_preserves_upstream_health() {
        let services = Services::new(proxy_config());
        let upstream = services.upstreams.get_by_name("a").unwrap();
        upstream.record_failure();
        upstream.record_failure();
        assert!(!upstream.is_healthy());

        services.reload(proxy_config()).unwrap();
        assert!(!services.upstreams.get_by_name("a").unwrap().is_healthy());
    }

    #[test]
    fn test_invalid_reload_keeps_old_state() {
        let services = Services::new(proxy_config());

        let mut bad = proxy_config();
        bad.proxy.upstreams.clear();
        assert!(services.reload(bad).is_err());

        // Old configuration still in force.
        assert!(services.state().config.proxy.enabled);
        assert_eq!(services.upstreams.len(), 1);
    }

    #[test]
    fn test_inflight_snapshot_survives_reload() {
        let services = Services::new(proxy_config());
        let snapshot = services.state();

        let mut next = proxy_config();
        next.proxy.load_balancing = LoadBalancingMethod::Random;
        services.reload(next).unwrap();

        // The old snapshot still reads its own consistent config.
        assert_eq!(
            snapshot.config.proxy.load_balancing,
            LoadBalancingMethod::RoundRobin
        );
    }
}
