use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub static_files: StaticConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Declarative routing table, highest priority first at match time
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on simultaneously accepted streams
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_true")]
    pub enable_http3: bool,

    #[serde(default = "default_true")]
    pub enable_http2: bool,

    #[serde(default = "default_true")]
    pub enable_http1: bool,

    /// Seconds to wait for in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub auto_cert: bool,

    #[serde(default = "default_tls_min")]
    pub min_version: String,

    #[serde(default = "default_tls_max")]
    pub max_version: String,

    /// Ordered ALPN identifiers advertised to clients
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    /// Directory for the ACME account key and issued-certificate cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_static_root")]
    pub root: String,

    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,

    #[serde(default = "default_true")]
    pub compression: bool,

    /// Content-type prefixes eligible for gzip variants
    #[serde(default = "default_compression_types")]
    pub compression_types: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,

    #[serde(default = "default_true")]
    pub etag: bool,

    #[serde(default)]
    pub autoindex: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,

    #[serde(default)]
    pub ddos_protection: DdosConfig,

    #[serde(default)]
    pub headers: SecurityHeadersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-client refill rate (tokens per minute)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Per-client bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Server-wide refill rate (tokens per minute)
    #[serde(default = "default_global_requests_per_minute")]
    pub global_requests_per_minute: u32,

    /// Server-wide bucket capacity
    #[serde(default = "default_global_burst")]
    pub global_burst: u32,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,

    #[serde(default)]
    pub auto_block_enabled: bool,

    /// Rate-limit violations before a client is auto-blocked
    #[serde(default = "default_auto_block_threshold")]
    pub auto_block_threshold: u32,

    /// Auto-block duration in seconds
    #[serde(default = "default_block_duration")]
    pub block_duration: u64,

    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,

    /// New connections allowed per client within `window_size`
    #[serde(default = "default_connection_rate_limit")]
    pub connection_rate_limit: u32,

    /// Packets (requests) allowed per client per second
    #[serde(default = "default_packet_rate_limit")]
    pub packet_rate_limit: u32,

    /// Connection window length in seconds
    #[serde(default = "default_window_size")]
    pub window_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    /// Strict-Transport-Security value, emitted when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hsts: Option<String>,

    /// Content-Security-Policy value, emitted when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub load_balancing: LoadBalancingMethod,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Upstream connection establishment timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Full-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Pooled connections idle longer than this are evicted (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Idle connections kept per upstream
    #[serde(default = "default_max_idle_per_upstream")]
    pub max_idle_per_upstream: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMethod {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
    Random,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Seconds an upstream stays unhealthy after crossing max_fails
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout: u64,

    /// Backup upstreams serve only when no primary is healthy
    #[serde(default)]
    pub backup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_health_status")]
    pub expected_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path pattern: literal, prefix wildcard (`/api/*`), or parameterized
    /// (`/users/:id`)
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// HTTP method constraint; absent means any method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default)]
    pub priority: u8,

    #[serde(default)]
    pub kind: RouteKindConfig,

    /// Target pool member name for proxy routes; empty selects by policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    /// Redirect target for redirect routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,

    /// Built-in handler id for api routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKindConfig {
    Static,
    #[default]
    Proxy,
    Redirect,
    Api,
    Websocket,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&contents).context("Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Built-in development preset used by `serve --dev`
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                max_connections: 1000,
                enable_http3: true,
                enable_http2: true,
                enable_http1: true,
                shutdown_grace: 5,
            },
            tls: TlsConfig::default(),
            static_files: StaticConfig {
                enabled: true,
                root: "./public".to_string(),
                ..StaticConfig::default()
            },
            security: SecurityConfig::default(),
            proxy: ProxyConfig {
                enabled: true,
                upstreams: vec![UpstreamConfig {
                    name: "example".to_string(),
                    address: "127.0.0.1".to_string(),
                    port: 9000,
                    weight: 1,
                    max_fails: 3,
                    fail_timeout: 30,
                    backup: false,
                }],
                ..ProxyConfig::default()
            },
            routes: vec![
                RouteConfig {
                    path: "/api/*".to_string(),
                    host: None,
                    method: None,
                    priority: 50,
                    kind: RouteKindConfig::Proxy,
                    upstream: Some("example".to_string()),
                    location: None,
                    code: None,
                    handler: None,
                },
                RouteConfig {
                    path: "/*".to_string(),
                    host: None,
                    method: Some("GET".to_string()),
                    priority: 10,
                    kind: RouteKindConfig::Static,
                    upstream: None,
                    location: None,
                    code: None,
                    handler: None,
                },
            ],
        }
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be in 1-65535");
        }

        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be greater than 0");
        }

        for version in [&self.tls.min_version, &self.tls.max_version] {
            if version != "tls12" && version != "tls13" {
                anyhow::bail!("tls version must be \"tls12\" or \"tls13\", got {:?}", version);
            }
        }
        if self.tls.min_version == "tls13" && self.tls.max_version == "tls12" {
            anyhow::bail!("tls.min_version exceeds tls.max_version");
        }

        if self.proxy.enabled && self.proxy.upstreams.is_empty() {
            anyhow::bail!("proxy.enabled requires at least one [[proxy.upstreams]] entry");
        }

        for upstream in &self.proxy.upstreams {
            if upstream.name.is_empty() {
                anyhow::bail!("upstream name cannot be empty");
            }
            if upstream.weight == 0 {
                anyhow::bail!("upstream {:?} weight must be >= 1", upstream.name);
            }
            if upstream.port == 0 {
                anyhow::bail!("upstream {:?} port must be in 1-65535", upstream.name);
            }
        }

        let hc = &self.proxy.health_check;
        if hc.enabled && hc.timeout >= hc.interval {
            anyhow::bail!("proxy.health_check.timeout must be strictly less than interval");
        }

        let rl = &self.security.rate_limiting;
        if rl.enabled && (rl.requests_per_minute == 0 || rl.burst == 0) {
            anyhow::bail!("rate_limiting requires requests_per_minute and burst >= 1");
        }

        for route in &self.routes {
            if route.path.is_empty() || !route.path.starts_with('/') {
                anyhow::bail!("route path {:?} must start with '/'", route.path);
            }
            match route.kind {
                RouteKindConfig::Proxy | RouteKindConfig::Websocket => {
                    if !self.proxy.enabled {
                        anyhow::bail!(
                            "route {:?} targets the proxy but proxy.enabled is false",
                            route.path
                        );
                    }
                    if let Some(name) = &route.upstream {
                        if !self.proxy.upstreams.iter().any(|u| &u.name == name) {
                            anyhow::bail!(
                                "route {:?} references unknown upstream {:?}",
                                route.path,
                                name
                            );
                        }
                    }
                }
                RouteKindConfig::Redirect => {
                    if route.location.is_none() {
                        anyhow::bail!("redirect route {:?} requires a location", route.path);
                    }
                    if let Some(code) = route.code {
                        if !(300..400).contains(&code) {
                            anyhow::bail!("redirect route {:?} code {} is not 3xx", route.path, code);
                        }
                    }
                }
                RouteKindConfig::Static => {
                    if !self.static_files.enabled {
                        anyhow::bail!(
                            "route {:?} serves static files but static_files.enabled is false",
                            route.path
                        );
                    }
                }
                RouteKindConfig::Api => {}
            }
        }

        Ok(())
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            static_files: StaticConfig::default(),
            security: SecurityConfig::default(),
            proxy: ProxyConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            enable_http3: true,
            enable_http2: true,
            enable_http1: true,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            auto_cert: false,
            min_version: default_tls_min(),
            max_version: default_tls_max(),
            alpn: default_alpn(),
            cert_dir: None,
        }
    }
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_static_root(),
            index_files: default_index_files(),
            compression: true,
            compression_types: default_compression_types(),
            cache_control: None,
            etag: true,
            autoindex: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            global_requests_per_minute: default_global_requests_per_minute(),
            global_burst: default_global_burst(),
            max_request_size: default_max_request_size(),
            auto_block_enabled: false,
            auto_block_threshold: default_auto_block_threshold(),
            block_duration: default_block_duration(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections_per_ip: default_max_connections_per_ip(),
            connection_rate_limit: default_connection_rate_limit(),
            packet_rate_limit: default_packet_rate_limit(),
            window_size: default_window_size(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            load_balancing: LoadBalancingMethod::default(),
            upstreams: Vec::new(),
            health_check: HealthCheckConfig::default(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            max_idle_per_upstream: default_max_idle_per_upstream(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            path: default_health_path(),
            expected_status: default_health_status(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    10000
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_tls_min() -> String {
    "tls12".to_string()
}

fn default_tls_max() -> String {
    "tls13".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["h3".to_string(), "h2".to_string(), "http/1.1".to_string()]
}

fn default_static_root() -> String {
    "./public".to_string()
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string(), "index.htm".to_string()]
}

fn default_compression_types() -> Vec<String> {
    vec![
        "text/".to_string(),
        "application/javascript".to_string(),
        "application/json".to_string(),
        "application/xml".to_string(),
        "image/svg+xml".to_string(),
    ]
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

fn default_global_requests_per_minute() -> u32 {
    10_000
}

fn default_global_burst() -> u32 {
    1_000
}

fn default_max_request_size() -> u64 {
    10 * 1024 * 1024
}

fn default_auto_block_threshold() -> u32 {
    1
}

fn default_block_duration() -> u64 {
    300
}

fn default_max_connections_per_ip() -> u32 {
    100
}

fn default_connection_rate_limit() -> u32 {
    60
}

fn default_packet_rate_limit() -> u32 {
    1000
}

fn default_window_size() -> u64 {
    60
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    3
}

fn default_fail_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_status() -> u16 {
    200
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_max_idle_per_upstream() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let toml = r#"
[server]
port = 9443
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert!(config.static_files.enabled);
        assert!(!config.proxy.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[server]
bind_address = "127.0.0.1"
port = 443
max_connections = 5000

[tls]
auto_cert = true
min_version = "tls13"
max_version = "tls13"
alpn = ["h3"]

[static_files]
enabled = true
root = "/srv/www"
autoindex = true

[security.rate_limiting]
requests_per_minute = 120
burst = 20
auto_block_enabled = true
block_duration = 60
whitelist = ["10.0.0.1"]

[security.ddos_protection]
max_connections_per_ip = 50
connection_rate_limit = 30
packet_rate_limit = 500

[proxy]
enabled = true
load_balancing = "least_connections"

[[proxy.upstreams]]
name = "app-1"
address = "10.0.1.10"
port = 3000
weight = 2

[[proxy.upstreams]]
name = "app-2"
address = "10.0.1.11"
port = 3000
backup = true

[proxy.health_check]
enabled = true
interval = 10
timeout = 3
path = "/healthz"
expected_status = 204

[[routes]]
path = "/app/*"
kind = "proxy"
priority = 50

[[routes]]
path = "/*"
method = "GET"
kind = "static"
priority = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.upstreams.len(), 2);
        assert_eq!(
            config.proxy.load_balancing,
            LoadBalancingMethod::LeastConnections
        );
        assert!(config.proxy.upstreams[1].backup);
        assert_eq!(config.proxy.health_check.expected_status, 204);
        assert_eq!(config.security.rate_limiting.requests_per_minute, 120);
        assert_eq!(config.routes.len(), 2);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let toml = r#"
[server]
port = 0
"#;
        // port 0 parses but fails validation
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_without_upstreams_rejected() {
        let toml = r#"
[proxy]
enabled = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_timeout_must_undercut_interval() {
        let mut config = Config::development();
        config.proxy.health_check.enabled = true;
        config.proxy.health_check.interval = 5;
        config.proxy.health_check.timeout = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redirect_route_requires_location() {
        let mut config = Config::default();
        config.routes.push(RouteConfig {
            path: "/old".to_string(),
            host: None,
            method: None,
            priority: 0,
            kind: RouteKindConfig::Redirect,
            upstream: None,
            location: None,
            code: None,
            handler: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_development_preset_is_valid() {
        Config::development().validate().unwrap();
    }
}
