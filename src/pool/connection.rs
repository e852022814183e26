use bytes::Bytes;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Body type sent to upstreams; unifies streamed client bodies and
/// internally generated ones
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Connection pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to connect to upstream {0}: {1}")]
    ConnectFailed(String, String),

    #[error("connect to upstream {0} timed out")]
    ConnectTimeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake with upstream {0} failed: {1}")]
    Handshake(String, String),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per upstream authority
    pub max_idle_per_key: usize,

    /// Idle connections older than this are evicted
    pub max_idle: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 32,
            max_idle: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Pool counters exported via metrics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub idle_connections: usize,
}

struct IdleConnection {
    sender: http1::SendRequest<ProxyBody>,
    last_used: Instant,
}

impl IdleConnection {
    /// A connection is reusable while the sender can take a request and the
    /// idle age is within bounds
    fn is_live(&self, max_idle: Duration) -> bool {
        self.sender.is_ready() && self.last_used.elapsed() < max_idle
    }
}

/// Keyed idle-connection pool
///
/// Key is the upstream authority (`host:port`). Connections that hit a
/// transport error must be dropped by the caller, never released back.
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<IdleConnection>>>,
    config: PoolConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Reuse an idle connection to `authority` or open a new one
    pub async fn acquire(&self, authority: &str) -> Result<http1::SendRequest<ProxyBody>, PoolError> {
        {
            let mut idle = self.idle.lock().await;
            if let Some(list) = idle.get_mut(authority) {
                while let Some(conn) = list.pop() {
                    if conn.is_live(self.config.max_idle) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        debug!(upstream = %authority, "reusing pooled connection");
                        return Ok(conn.sender);
                    }
                    debug!(upstream = %authority, "evicting stale pooled connection");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.connect(authority).await
    }

    async fn connect(&self, authority: &str) -> Result<http1::SendRequest<ProxyBody>, PoolError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| PoolError::ConnectTimeout(authority.to_string()))?
            .map_err(|e| PoolError::ConnectFailed(authority.to_string(), e.to_string()))?;

        stream.set_nodelay(true)?;

        // TCP keepalive so half-dead origins are noticed between requests
        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        let stream = TcpStream::from_std(socket.into())?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| PoolError::Handshake(authority.to_string(), e.to_string()))?;

        let authority_owned = authority.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(upstream = %authority_owned, error = %e, "upstream connection error");
            }
        });

        debug!(upstream = %authority, "opened upstream connection");
        Ok(sender)
    }

    /// Return a connection after a clean exchange. Full per-key lists close
    /// the connection instead.
    pub async fn release(&self, authority: &str, sender: http1::SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }

        let mut idle = self.idle.lock().await;
        let list = idle.entry(authority.to_string()).or_default();
        if list.len() < self.config.max_idle_per_key {
            list.push(IdleConnection {
                sender,
                last_used: Instant::now(),
            });
        }
        // Over capacity: drop, which closes the connection.
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle_connections: 0,
        }
    }

    /// Stats including the current idle count (takes the pool lock)
    pub async fn stats_with_idle(&self) -> PoolStats {
        let idle = self.idle.lock().await;
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle_connections: idle.values().map(|l| l.len()).sum(),
        }
    }

    /// Drop every idle connection
    pub async fn clear(&self) {
        self.idle.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use tokio::net::TcpListener;

    async fn spawn_origin() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let service = service_fn(|_req| async {
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"pong"))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        authority
    }

    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed()
    }

    #[tokio::test]
    async fn test_acquire_counts_miss_then_hit() {
        let authority = spawn_origin().await;
        let pool = ConnectionPool::new(PoolConfig::default());

        let mut sender = pool.acquire(&authority).await.unwrap();
        assert_eq!(pool.stats().misses, 1);
        assert_eq!(pool.stats().hits, 0);

        // Complete one exchange so the sender is ready for reuse.
        let request = Request::builder()
            .uri("/")
            .header("host", &authority)
            .body(empty_body())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let _ = response.collect().await.unwrap();

        pool.release(&authority, sender).await;
        let _sender = pool.acquire(&authority).await.unwrap();
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_hits_plus_misses_equals_acquires() {
        let authority = spawn_origin().await;
        let pool = ConnectionPool::new(PoolConfig::default());

        for _ in 0..5 {
            let sender = pool.acquire(&authority).await.unwrap();
            pool.release(&authority, sender).await;
        }

        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 5);
    }

    #[tokio::test]
    async fn test_idle_expiry_evicts() {
        let authority = spawn_origin().await;
        let pool = ConnectionPool::new(PoolConfig {
            max_idle: Duration::from_millis(50),
            ..PoolConfig::default()
        });

        let sender = pool.acquire(&authority).await.unwrap();
        pool.release(&authority, sender).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        // The idle entry is past max_idle, so this acquire reconnects.
        let _sender = pool.acquire(&authority).await.unwrap();
        assert_eq!(pool.stats().misses, 2);
        assert_eq!(pool.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_per_key_ceiling() {
        let authority = spawn_origin().await;
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_key: 2,
            ..PoolConfig::default()
        });

        let a = pool.acquire(&authority).await.unwrap();
        let b = pool.acquire(&authority).await.unwrap();
        let c = pool.acquire(&authority).await.unwrap();

        pool.release(&authority, a).await;
        pool.release(&authority, b).await;
        pool.release(&authority, c).await;

        let stats = pool.stats_with_idle().await;
        assert_eq!(stats.idle_connections, 2);
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let pool = ConnectionPool::new(PoolConfig::default());
        let result = pool.acquire(&authority).await;
        assert!(matches!(result, Err(PoolError::ConnectFailed(_, _))));
    }

    #[tokio::test]
    async fn test_clear_drops_idle() {
        let authority = spawn_origin().await;
        let pool = ConnectionPool::new(PoolConfig::default());

        let sender = pool.acquire(&authority).await.unwrap();
        pool.release(&authority, sender).await;
        pool.clear().await;

        assert_eq!(pool.stats_with_idle().await.idle_connections, 0);
    }
}
