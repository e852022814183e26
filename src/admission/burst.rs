//! Burst-rate tracking for DDoS protection
//!
//! Two fixed sliding windows per client: new connections over the configured
//! window (default 60s) and packets over one second. Counters reset lazily
//! when their window rolls over, so an idle client costs nothing.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::DdosConfig;

const PACKET_WINDOW: Duration = Duration::from_secs(1);

/// Why the tracker rejected a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstViolation {
    ConnectionFlood,
    PacketFlood,
    TooManyConnections,
}

impl BurstViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BurstViolation::ConnectionFlood => "connection_flood",
            BurstViolation::PacketFlood => "packet_flood",
            BurstViolation::TooManyConnections => "too_many_connections",
        }
    }
}

#[derive(Debug)]
struct ClientWindows {
    connection_window_start: Instant,
    connections_in_window: u32,
    packet_window_start: Instant,
    packets_in_window: u32,
    active_connections: u32,
    last_activity: Instant,
}

impl ClientWindows {
    fn new(now: Instant) -> Self {
        Self {
            connection_window_start: now,
            connections_in_window: 0,
            packet_window_start: now,
            packets_in_window: 0,
            active_connections: 0,
            last_activity: now,
        }
    }

    fn roll(&mut self, now: Instant, connection_window: Duration) {
        if now.duration_since(self.connection_window_start) >= connection_window {
            self.connection_window_start = now;
            self.connections_in_window = 0;
        }
        if now.duration_since(self.packet_window_start) >= PACKET_WINDOW {
            self.packet_window_start = now;
            self.packets_in_window = 0;
        }
    }
}

/// Per-client burst counters, independent of the token-bucket rate limiter
pub struct BurstTracker {
    config: DdosConfig,
    clients: DashMap<IpAddr, ClientWindows>,
}

impl BurstTracker {
    pub fn new(config: DdosConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_size)
    }

    /// Record an accepted connection. Returns a violation if the client is
    /// over its connection-rate or concurrent-connection ceiling.
    pub fn record_connection(&self, client: IpAddr) -> Option<BurstViolation> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let window = self.window();
        let mut entry = self
            .clients
            .entry(client)
            .or_insert_with(|| ClientWindows::new(now));

        entry.roll(now, window);
        entry.last_activity = now;
        entry.connections_in_window += 1;
        entry.active_connections += 1;

        if entry.active_connections > self.config.max_connections_per_ip {
            warn!(client = %client, active = entry.active_connections, "connection ceiling exceeded");
            return Some(BurstViolation::TooManyConnections);
        }

        if entry.connections_in_window > self.config.connection_rate_limit {
            warn!(client = %client, count = entry.connections_in_window, "connection rate exceeded");
            return Some(BurstViolation::ConnectionFlood);
        }

        None
    }

    /// Record a closed connection
    pub fn record_disconnect(&self, client: IpAddr) {
        if !self.config.enabled {
            return;
        }

        if let Some(mut entry) = self.clients.get_mut(&client) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
            entry.last_activity = Instant::now();
        }
    }

    /// Record one request (packet). Returns a violation if the client is over
    /// its per-second packet ceiling.
    pub fn record_packet(&self, client: IpAddr) -> Option<BurstViolation> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let window = self.window();
        let mut entry = self
            .clients
            .entry(client)
            .or_insert_with(|| ClientWindows::new(now));

        entry.roll(now, window);
        entry.last_activity = now;
        entry.packets_in_window += 1;

        if entry.packets_in_window > self.config.packet_rate_limit {
            warn!(client = %client, count = entry.packets_in_window, "packet rate exceeded");
            return Some(BurstViolation::PacketFlood);
        }

        None
    }

    /// Drop entries idle for more than 10x the window with no live connections
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.window() * 10;
        self.clients.retain(|_, entry| {
            entry.active_connections > 0 || now.duration_since(entry.last_activity) < horizon
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}
