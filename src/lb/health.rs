use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::HealthCheckConfig;
use crate::lb::upstream::{Upstream, UpstreamPool};

/// Active health checker
///
/// Probes every pool member on a fixed interval with an isolated task per
/// member, so one slow origin never delays the others. Probe results feed
/// the upstream health state machine.
pub struct HealthChecker {
    pool: Arc<UpstreamPool>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, config: HealthCheckConfig) -> Self {
        Self { pool, config }
    }

    /// Start the probe loop. Returns a handle that runs until aborted.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("health checker disabled");
                return;
            }

            info!(
                interval_secs = self.config.interval,
                path = %self.config.path,
                expected_status = self.config.expected_status,
                "health checker started"
            );

            loop {
                let start = Instant::now();
                self.probe_all().await;
                debug!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    "health check cycle completed"
                );

                sleep(Duration::from_secs(self.config.interval)).await;
            }
        })
    }

    async fn probe_all(&self) {
        let mut handles = Vec::new();

        for upstream in self.pool.all() {
            let config = self.config.clone();
            handles.push(tokio::spawn(async move {
                Self::probe(&upstream, &config).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn probe(upstream: &Arc<Upstream>, config: &HealthCheckConfig) {
        let start = Instant::now();
        match Self::probe_once(upstream, config).await {
            Ok(status) if status.as_u16() == config.expected_status => {
                debug!(
                    upstream = %upstream.name,
                    status = status.as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "probe ok"
                );
                upstream.probe_success();
            }
            Ok(status) => {
                debug!(
                    upstream = %upstream.name,
                    status = status.as_u16(),
                    expected = config.expected_status,
                    "probe returned unexpected status"
                );
                upstream.probe_failure();
            }
            Err(e) => {
                debug!(upstream = %upstream.name, error = %e, "probe failed");
                upstream.probe_failure();
            }
        }
    }

    async fn probe_once(
        upstream: &Arc<Upstream>,
        config: &HealthCheckConfig,
    ) -> Result<StatusCode, Box<dyn std::error::Error + Send + Sync>> {
        let timeout = Duration::from_secs(config.timeout);
        let authority = upstream.authority();

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(format!("connect failed: {}", e).into()),
            Err(_) => return Err("connect timeout".into()),
        };

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "probe connection error");
            }
        });

        let request = Request::builder()
            .method("GET")
            .uri(&config.path)
            .header("host", &authority)
            .header("user-agent", concat!("wraith-health/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())?;

        let response = match tokio::time::timeout(timeout, sender.send_request(request)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(format!("probe request failed: {}", e).into()),
            Err(_) => return Err("probe timeout".into()),
        };

        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::Response;
    use tokio::net::TcpListener;

    fn pool_with(port: u16, max_fails: u32) -> Arc<UpstreamPool> {
        Arc::new(UpstreamPool::new(&[UpstreamConfig {
            name: "origin".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            weight: 1,
            max_fails,
            fail_timeout: 0,
            backup: false,
        }]))
    }

    async fn spawn_origin(status: StatusCode) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move {
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"ok")))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_probe_success_on_expected_status() {
        let port = spawn_origin(StatusCode::OK).await;
        let pool = pool_with(port, 1);
        let upstream = pool.get_by_name("origin").unwrap();
        upstream.record_failure();
        assert!(!upstream.is_healthy());

        let config = HealthCheckConfig {
            enabled: true,
            interval: 30,
            timeout: 2,
            path: "/health".to_string(),
            expected_status: 200,
        };

        HealthChecker::probe(&upstream, &config).await;
        assert!(upstream.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_failure_on_wrong_status() {
        let port = spawn_origin(StatusCode::INTERNAL_SERVER_ERROR).await;
        let pool = pool_with(port, 1);
        let upstream = pool.get_by_name("origin").unwrap();

        let config = HealthCheckConfig {
            enabled: true,
            interval: 30,
            timeout: 2,
            path: "/health".to_string(),
            expected_status: 200,
        };

        HealthChecker::probe(&upstream, &config).await;
        assert!(!upstream.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_failure_on_refused_connection() {
        // Bind and drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = pool_with(port, 1);
        let upstream = pool.get_by_name("origin").unwrap();

        let config = HealthCheckConfig {
            enabled: true,
            interval: 30,
            timeout: 1,
            path: "/health".to_string(),
            expected_status: 200,
        };

        HealthChecker::probe(&upstream, &config).await;
        assert!(!upstream.is_healthy());
    }
}
