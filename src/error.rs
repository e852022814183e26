//! Crate-wide error type
//!
//! Every fallible boundary in the data plane collapses into [`WraithError`],
//! which knows the HTTP status a client should see. Component-local error
//! enums (`PoolError`, `ForwardError`, `StaticError`) convert into it at the
//! pipeline seam.

use hyper::StatusCode;
use thiserror::Error;

use crate::pool::PoolError;
use crate::proxy::ForwardError;
use crate::static_files::StaticError;

#[derive(Debug, Error)]
pub enum WraithError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no healthy upstreams available")]
    NoHealthyUpstreams,

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Static(#[from] StaticError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WraithError {
    /// Status a client sees for this failure. Internal details never leak
    /// into the response body.
    pub fn client_status(&self) -> StatusCode {
        match self {
            WraithError::Config(_) | WraithError::Bind { .. } | WraithError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            WraithError::NoHealthyUpstreams => StatusCode::BAD_GATEWAY,
            WraithError::Forward(e) => e.client_status(),
            WraithError::Pool(_) => StatusCode::BAD_GATEWAY,
            WraithError::Static(e) => e.client_status(),
            WraithError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
