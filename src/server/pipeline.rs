//! Per-request pipeline
//!
//! Ordering for one request: admission → reserved endpoints → router →
//! {static | redirect | api | upstream selection → forward}. Every
//! short-circuit still emits a response and updates metrics; resources
//! acquired by earlier stages are released on every path.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::Decision;
use crate::config::Config;
use crate::core::{Services, State};
use crate::error::WraithError;
use crate::pool::ProxyBody;
use crate::router::{RouteKind, RoutingRequest};
use crate::server::ServerControl;

/// Handle one decoded request end to end
pub async fn handle(
    services: Arc<Services>,
    control: ServerControl,
    request: Request<Incoming>,
    client: SocketAddr,
) -> Response<ProxyBody> {
    let state = services.state();
    let start = Instant::now();
    services.metrics.record_request();

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = dispatch(&services, &state, &control, request, client).await;

    let status = response.status().as_u16();
    services.metrics.record_response(status);
    info!(
        method = %method,
        path = %path,
        client = %client.ip(),
        status,
        duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

async fn dispatch(
    services: &Arc<Services>,
    state: &Arc<State>,
    control: &ServerControl,
    request: Request<Incoming>,
    client: SocketAddr,
) -> Response<ProxyBody> {
    // Admission votes first.
    let request_size = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let decision = state.admission.check(client.ip(), request_size);
    if !decision.allowed {
        services.metrics.record_denied();
        debug!(
            client = %client.ip(),
            reason = decision.reason.as_str(),
            "request denied"
        );
        return denied_response(&decision);
    }

    // Reserved endpoints bypass the routing table.
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/health") => return health_response(&state.config),
        (&Method::GET, "/status") => return status_response(services, state),
        (&Method::POST, "/admin/reload") => {
            control.request_reload();
            return json_response(StatusCode::OK, json!({"status": "reload scheduled"}));
        }
        (&Method::POST, "/admin/stop") => {
            control.request_shutdown();
            return json_response(StatusCode::OK, json!({"status": "shutting down"}));
        }
        _ => {}
    }

    let host = request
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let routing_request = RoutingRequest {
        method: &method,
        path: &path,
        host: host.as_deref(),
        headers: request.headers(),
        client_addr: client,
    };

    let Some(decision) = state.router.match_request(&routing_request) else {
        services.metrics.record_route_miss();
        return error_response(StatusCode::NOT_FOUND);
    };

    match decision.route.kind.clone() {
        RouteKind::Static => {
            let headers = request.headers().clone();
            serve_static(state, &method, &path, &headers).await
        }
        RouteKind::Proxy { upstream } | RouteKind::Websocket { upstream } => {
            forward_to_upstream(services, state, upstream.as_deref(), request, client).await
        }
        RouteKind::Redirect { location, code } => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::FOUND);
            let mut response = Response::builder()
                .status(status)
                .body(empty_body())
                .unwrap_or_else(|_| Response::new(empty_body()));
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert("location", value);
            }
            response
        }
        RouteKind::Api { handler } => match handler.as_str() {
            "health" => health_response(&state.config),
            "status" => status_response(services, state),
            _ => error_response(StatusCode::NOT_FOUND),
        },
    }
}

async fn serve_static(
    state: &Arc<State>,
    method: &Method,
    path: &str,
    headers: &hyper::header::HeaderMap,
) -> Response<ProxyBody> {
    if method != Method::GET && method != Method::HEAD {
        return error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    match state.static_files.serve(path, headers).await {
        Ok(static_response) => {
            let body = if method == Method::HEAD {
                empty_body()
            } else {
                full_body(static_response.body)
            };

            let mut response = Response::new(body);
            *response.status_mut() = static_response.status;
            *response.headers_mut() = static_response.headers;
            response
        }
        Err(e) => {
            let err = WraithError::from(e);
            let status = err.client_status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                warn!(path = %path, error = %err, "static read failed");
            }
            error_response(status)
        }
    }
}

async fn forward_to_upstream(
    services: &Arc<Services>,
    state: &Arc<State>,
    upstream_name: Option<&str>,
    request: Request<Incoming>,
    client: SocketAddr,
) -> Response<ProxyBody> {
    // A pinned healthy member wins; otherwise the balancer picks over the
    // healthy snapshot.
    let pinned = upstream_name
        .and_then(|name| services.upstreams.get_by_name(name))
        .filter(|u| u.is_healthy());

    let upstream = match pinned {
        Some(upstream) => upstream,
        None => {
            let snapshot = services.upstreams.healthy_snapshot();
            match state.balancer.select(&snapshot, client.ip()) {
                Some(upstream) => upstream,
                None => {
                    let err = WraithError::NoHealthyUpstreams;
                    warn!(error = %err, "cannot select upstream");
                    return error_response(err.client_status());
                }
            }
        }
    };

    let request = request.map(|body| body.boxed());

    match state.forwarder.forward(&upstream, request).await {
        Ok(response) => response,
        Err(e) => error_response(WraithError::from(e).client_status()),
    }
}

fn denied_response(decision: &Decision) -> Response<ProxyBody> {
    let mut payload = json!({ "error": decision.reason.as_str() });
    if let Some(retry_after) = decision.retry_after {
        payload["retry_after"] = json!(retry_after.as_secs());
    }

    let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, payload);
    if let Some(retry_after) = decision.retry_after {
        response.headers_mut().insert(
            "retry-after",
            HeaderValue::from(retry_after.as_secs().max(1)),
        );
    }
    response
}

/// Protocol and transport strings advertised by the reserved endpoints
fn protocol_strings(config: &Config) -> (&'static str, &'static str) {
    if config.server.enable_http3 {
        ("HTTP/3", "QUIC")
    } else if config.server.enable_http2 {
        ("HTTP/2", "TCP")
    } else {
        ("HTTP/1.1", "TCP")
    }
}

fn health_response(config: &Config) -> Response<ProxyBody> {
    let (protocol, transport) = protocol_strings(config);
    json_response(
        StatusCode::OK,
        json!({
            "status": "ok",
            "protocol": protocol,
            "transport": transport,
        }),
    )
}

fn status_response(services: &Arc<Services>, state: &Arc<State>) -> Response<ProxyBody> {
    let (protocol, transport) = protocol_strings(&state.config);
    json_response(
        StatusCode::OK,
        json!({
            "server": "wraith",
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": protocol,
            "transport": transport,
            "tls": {
                "auto_cert": state.config.tls.auto_cert,
                "min_version": state.config.tls.min_version,
                "max_version": state.config.tls.max_version,
                "alpn": state.config.tls.alpn,
            },
            "uptime": services.metrics.uptime_seconds(),
            "metrics": services.metrics.snapshot(),
            "upstreams": services.upstreams.stats(),
            "connection_pool": services.connections.stats(),
            "rate_limiter": {
                "blocked_clients": state.admission.blocked_count(),
                "tracked_clients": state.admission.tracked_clients(),
            },
            "static_cache": state.static_files.cache_stats(),
        }),
    )
}

fn json_response(status: StatusCode, payload: serde_json::Value) -> Response<ProxyBody> {
    let body = payload.to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("content-length", body.len())
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Plain error page; never exposes internal details
pub fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{code} {reason}</title></head>\n\
         <body>\n<h1>{code} {reason}</h1>\n</body>\n</html>\n",
        code = status.as_u16(),
        reason = reason,
    );

    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .header("content-length", body.len())
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}
