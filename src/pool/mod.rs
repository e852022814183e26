//! Upstream connection pooling
//!
//! Idle HTTP/1.1 connections are kept per upstream authority and reused
//! across requests. Eviction happens at acquire time: stale or not-ready
//! senders are discarded before the search succeeds.

pub mod connection;

pub use connection::{ConnectionPool, PoolConfig, PoolError, PoolStats, ProxyBody};
