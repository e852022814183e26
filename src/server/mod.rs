//! Accept loop, reload wiring, graceful shutdown
//!
//! One task per connection; each request snapshots the current service
//! state, so a reload swaps the tables atomically while in-flight requests
//! drain against the old ones.

pub mod pipeline;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::Services;
use crate::error::WraithError;
use crate::lb::HealthChecker;

/// Exit code used when the server stopped on an operator signal
pub const EXIT_SIGNAL: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Reload,
    Shutdown,
}

/// Handle the pipeline uses to ask the server for a reload or shutdown
#[derive(Clone)]
pub struct ServerControl {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ServerControl {
    pub fn request_reload(&self) {
        let _ = self.tx.send(ControlCommand::Reload);
    }

    pub fn request_shutdown(&self) {
        let _ = self.tx.send(ControlCommand::Shutdown);
    }
}

pub struct Server {
    services: Arc<Services>,
    /// Config file re-read on reload; `None` in dev mode
    config_path: Option<PathBuf>,
}

impl Server {
    pub fn new(services: Arc<Services>, config_path: Option<PathBuf>) -> Self {
        Self {
            services,
            config_path,
        }
    }

    /// Run until shutdown. Returns the process exit code.
    pub async fn run(self) -> Result<i32, WraithError> {
        let state = self.services.state();
        let addr = format!(
            "{}:{}",
            state.config.server.bind_address, state.config.server.port
        );
        let max_connections = state.config.server.max_connections;
        drop(state);

        let listener = TcpListener::bind(&addr).await.map_err(|e| WraithError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        info!(addr = %addr, "wraith listening");

        let mut health_handle = self.spawn_health_checker();
        let sweep_handle = self.spawn_admission_sweep();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = ServerControl { tx };
        let active = Arc::new(AtomicU32::new(0));

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| WraithError::Internal(format!("signal setup failed: {}", e)))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| WraithError::Internal(format!("signal setup failed: {}", e)))?;
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        let mut stopped_by_signal = false;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.accept(stream, peer, &control, &active, max_connections);
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                Some(command) = rx.recv() => match command {
                    ControlCommand::Reload => {
                        self.reload(&mut health_handle);
                    }
                    ControlCommand::Shutdown => {
                        info!("shutdown requested");
                        break;
                    }
                },
                _ = &mut interrupt => {
                    info!("interrupt received");
                    stopped_by_signal = true;
                    break;
                }
                _ = sigterm.recv() => {
                    info!("terminate received");
                    stopped_by_signal = true;
                    break;
                }
                _ = sighup.recv() => {
                    self.reload(&mut health_handle);
                }
            }
        }

        // Stop accepting, drain in-flight connections up to the grace period.
        drop(listener);
        let grace = self.services.shutdown_grace();
        info!(grace_secs = grace.as_secs(), "draining connections");
        let deadline = Instant::now() + grace;
        while active.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = active.load(Ordering::Acquire);
        if remaining > 0 {
            warn!(remaining, "grace period expired with connections still open");
        }

        health_handle.abort();
        sweep_handle.abort();
        self.services.connections.clear().await;
        info!("server stopped");

        Ok(if stopped_by_signal { EXIT_SIGNAL } else { 0 })
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        control: &ServerControl,
        active: &Arc<AtomicU32>,
        max_connections: u32,
    ) {
        let state = self.services.state();

        // Over the stream ceiling: answer 503 and close.
        if active.load(Ordering::Acquire) >= max_connections {
            warn!(client = %peer.ip(), "connection ceiling reached");
            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    Ok::<_, std::convert::Infallible>(pipeline::error_response(
                        hyper::StatusCode::SERVICE_UNAVAILABLE,
                    ))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .keep_alive(false)
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
            return;
        }

        // Burst-tracker connection window; violators are blocked and dropped.
        if !state.admission.admit_connection(peer.ip()) {
            drop(stream);
            return;
        }

        active.fetch_add(1, Ordering::AcqRel);

        let services = self.services.clone();
        let control = control.clone();
        let active = active.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn({
                let services = services.clone();
                let control = control.clone();
                move |request| {
                    let services = services.clone();
                    let control = control.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            pipeline::handle(services, control, request, peer).await,
                        )
                    }
                }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                let message = e.to_string();
                if !message.contains("connection reset") && !message.contains("broken pipe") {
                    error!(client = %peer, error = %message, "connection error");
                }
            }

            active.fetch_sub(1, Ordering::AcqRel);
            services.state().admission.connection_closed(peer.ip());
        });
    }

    fn spawn_health_checker(&self) -> tokio::task::JoinHandle<()> {
        let state = self.services.state();
        let checker = Arc::new(HealthChecker::new(
            self.services.upstreams.clone(),
            state.config.proxy.health_check.clone(),
        ));
        checker.start()
    }

    fn spawn_admission_sweep(&self) -> tokio::task::JoinHandle<()> {
        let services = self.services.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                services.state().admission.cleanup();
            }
        })
    }

    /// Re-read the config file and swap the data plane. Failure leaves the
    /// running configuration untouched.
    fn reload(&self, health_handle: &mut tokio::task::JoinHandle<()>) {
        let Some(path) = &self.config_path else {
            warn!("reload requested but no config file is in use");
            return;
        };

        let config = match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "reload rejected: config invalid");
                return;
            }
        };

        if let Err(e) = self.services.reload(config) {
            error!(error = %e, "reload rejected");
            return;
        }

        // Probe parameters may have changed; restart the checker.
        health_handle.abort();
        *health_handle = self.spawn_health_checker();
    }
}
