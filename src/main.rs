use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wraith::config::Config;
use wraith::error::WraithError;
use wraith::server::Server;
use wraith::Services;

#[derive(Parser)]
#[command(name = "wraith")]
#[command(version, about = "HTTP reverse proxy and edge gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short = 'c', long, global = true, default_value = "wraith.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Override the configured listen port
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Development mode with a built-in configuration
        #[arg(short = 'd', long)]
        dev: bool,
    },

    /// Validate a configuration file and exit
    Test,

    /// Ask a running server to reload its configuration
    Reload {
        /// Server endpoint
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Ask a running server to stop
    Stop {
        /// Server endpoint
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Fetch a running server's status
    Status {
        /// Server endpoint
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },

    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("wraith={}", cli.log_level).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    // The server wants the multithreaded runtime; one-shot commands run on
    // a current-thread runtime.
    let is_serve = matches!(cli.command, Commands::Serve { .. });
    let runtime = if is_serve {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    };

    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Serve { port, dev } => {
            let mut config = if dev {
                info!("running in development mode");
                Config::development()
            } else {
                match Config::from_file(&cli.config) {
                    Ok(config) => config,
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "configuration invalid");
                        return 2;
                    }
                }
            };

            if let Some(port) = port {
                config.server.port = port;
                if let Err(e) = config.validate() {
                    error!(error = %format!("{:#}", e), "configuration invalid");
                    return 2;
                }
            }

            let services = Arc::new(Services::new(config));
            let config_path = if dev { None } else { Some(cli.config) };
            let server = Server::new(services, config_path);

            match server.run().await {
                Ok(code) => code,
                Err(e @ WraithError::Bind { .. }) => {
                    error!(error = %e, "bind failed");
                    3
                }
                Err(e) => {
                    error!(error = %e, "server error");
                    1
                }
            }
        }

        Commands::Test => match Config::from_file(&cli.config) {
            Ok(_) => {
                println!("wraith: configuration file {} syntax is ok", cli.config.display());
                0
            }
            Err(e) => {
                eprintln!(
                    "wraith: configuration file {} test failed: {:#}",
                    cli.config.display(),
                    e
                );
                2
            }
        },

        Commands::Reload { endpoint } => {
            match admin_request(&endpoint, Method::POST, "/admin/reload").await {
                Ok((status, _)) if status.is_success() => {
                    println!("wraith: reload signal sent");
                    0
                }
                Ok((status, _)) => {
                    eprintln!("wraith: reload failed with status {}", status);
                    1
                }
                Err(e) => {
                    eprintln!("wraith: could not reach server at {}: {:#}", endpoint, e);
                    1
                }
            }
        }

        Commands::Stop { endpoint } => {
            match admin_request(&endpoint, Method::POST, "/admin/stop").await {
                Ok((status, _)) if status.is_success() => {
                    println!("wraith: stop signal sent");
                    0
                }
                Ok((status, _)) => {
                    eprintln!("wraith: stop failed with status {}", status);
                    1
                }
                Err(e) => {
                    eprintln!("wraith: could not reach server at {}: {:#}", endpoint, e);
                    1
                }
            }
        }

        Commands::Status { endpoint } => {
            match admin_request(&endpoint, Method::GET, "/status").await {
                Ok((status, body)) if status.is_success() => {
                    match serde_json::from_slice::<serde_json::Value>(&body) {
                        Ok(value) => {
                            println!(
                                "{}",
                                serde_json::to_string_pretty(&value)
                                    .unwrap_or_else(|_| value.to_string())
                            );
                            0
                        }
                        Err(_) => {
                            println!("{}", String::from_utf8_lossy(&body));
                            0
                        }
                    }
                }
                Ok((status, _)) => {
                    eprintln!("wraith: status request failed with status {}", status);
                    1
                }
                Err(e) => {
                    eprintln!("wraith: could not reach server at {}: {:#}", endpoint, e);
                    1
                }
            }
        }

        Commands::Version => {
            println!("wraith v{}", env!("CARGO_PKG_VERSION"));
            println!("HTTP reverse proxy and edge gateway");
            0
        }
    }
}

/// One-shot request to a running server's admin surface
async fn admin_request(
    endpoint: &str,
    method: Method,
    path: &str,
) -> Result<(StatusCode, Bytes)> {
    let authority = endpoint
        .strip_prefix("http://")
        .unwrap_or(endpoint)
        .trim_end_matches('/');

    let stream = TcpStream::connect(authority)
        .await
        .context(format!("connect to {} failed", authority))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("handshake failed")?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("host", authority)
        .body(Empty::<Bytes>::new())
        .context("request build failed")?;

    let response = sender.send_request(request).await.context("request failed")?;
    let status = response.status();
    let body = response
        .collect()
        .await
        .context("response read failed")?
        .to_bytes();

    Ok((status, body))
}
