//! Request forwarding to upstream origins
//!
//! The forwarder streams one client request through a pooled upstream
//! connection: hop-by-hop headers are stripped in both directions, bodies
//! flow chunk-by-chunk, and failures are classified into the status the
//! client should see plus the effect on the upstream's health state.

pub mod forwarder;

pub use forwarder::{ForwardError, Forwarder};
