use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::lb::upstream::Upstream;
use crate::pool::{ConnectionPool, PoolError, ProxyBody};

/// Headers scoped to a single connection; never forwarded in either
/// direction
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const PROXIED_BY: &str = concat!("Wraith/", env!("CARGO_PKG_VERSION"));

/// Forwarding failures, classified per their client-visible status
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream connect failed: {0}")]
    Connect(#[source] PoolError),

    #[error("upstream {upstream} timed out")]
    Timeout { upstream: String },

    #[error("upstream {upstream} reset: {message}")]
    PeerReset { upstream: String, message: String },
}

impl ForwardError {
    pub fn client_status(&self) -> StatusCode {
        match self {
            ForwardError::Connect(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::PeerReset { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Decrements `active_connections` exactly once, even when the request task
/// is cancelled mid-forward
struct RequestGuard(Arc<Upstream>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.end_request();
    }
}

/// Streams requests to a selected upstream through the connection pool
pub struct Forwarder {
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl Forwarder {
    pub fn new(pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }

    /// Forward one request. Counters move before dispatch; the upstream's
    /// health state is updated from the outcome.
    pub async fn forward(
        &self,
        upstream: &Arc<Upstream>,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        upstream.begin_request();
        let _guard = RequestGuard(upstream.clone());

        let result = self.dispatch(upstream, request).await;

        match &result {
            // The upstream answered; a 5xx from it is still an answer.
            Ok(response) => {
                debug!(
                    upstream = %upstream.name,
                    status = response.status().as_u16(),
                    "upstream responded"
                );
                upstream.record_success();
            }
            Err(e) => {
                warn!(upstream = %upstream.name, error = %e, "forward failed");
                upstream.record_failure();
            }
        }

        result
    }

    async fn dispatch(
        &self,
        upstream: &Arc<Upstream>,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let authority = upstream.authority();

        // Origin-form target for the HTTP/1.1 upstream connection.
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *request.uri_mut() = target
            .parse::<Uri>()
            .unwrap_or_else(|_| Uri::from_static("/"));

        strip_hop_by_hop(request.headers_mut());
        request
            .headers_mut()
            .insert("x-proxied-by", HeaderValue::from_static(PROXIED_BY));

        let mut sender = self
            .pool
            .acquire(&authority)
            .await
            .map_err(|e| match e {
                PoolError::ConnectTimeout(_) => ForwardError::Timeout {
                    upstream: authority.clone(),
                },
                other => ForwardError::Connect(other),
            })?;

        let response =
            match tokio::time::timeout(self.request_timeout, sender.send_request(request)).await {
                Ok(Ok(response)) => response,
                // Errored senders are dropped, never released back.
                Ok(Err(e)) => {
                    return Err(ForwardError::PeerReset {
                        upstream: authority,
                        message: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(ForwardError::Timeout {
                        upstream: authority,
                    })
                }
            };

        // Headers are in; the sender goes back to the pool and becomes
        // reusable once the response body is fully relayed.
        self.pool.release(&authority, sender).await;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Remove the hop-by-hop header set
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
