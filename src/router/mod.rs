//! Route matching engine
//!
//! The routing table is immutable after construction; reloads build a new
//! table and swap it wholesale. Matching is a linear scan over the
//! priority-sorted routes, so a given table always produces the same decision
//! for the same request.

use hyper::header::HeaderMap;
use hyper::Method;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

use crate::config::{Config, RouteConfig, RouteKindConfig};

/// What a matched route resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    Static,
    Proxy {
        /// Pin to a named pool member; `None` selects by policy
        upstream: Option<String>,
    },
    Redirect {
        location: String,
        code: u16,
    },
    Api {
        handler: String,
    },
    Websocket {
        upstream: Option<String>,
    },
}

/// A compiled path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    /// Full-string equality
    Literal(String),
    /// `/prefix/*`: matches any path starting with the prefix
    Prefix(String),
    /// Segment-wise match with `:name` captures
    Parameterized(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        if let Some(prefix) = raw.strip_suffix("/*") {
            return Pattern::Prefix(prefix.to_string());
        }

        if raw.split('/').any(|s| s.starts_with(':')) {
            let segments = raw
                .split('/')
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(s.to_string()),
                })
                .collect();
            return Pattern::Parameterized(segments);
        }

        Pattern::Literal(raw.to_string())
    }

    /// Match a request path, capturing parameter segments on success
    fn matches(&self, path: &str, params: &mut HashMap<String, String>) -> bool {
        match self {
            Pattern::Literal(literal) => literal == path,
            Pattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Pattern::Parameterized(segments) => {
                let parts: Vec<&str> = path.split('/').collect();
                if parts.len() != segments.len() {
                    return false;
                }

                for (segment, part) in segments.iter().zip(parts.iter()) {
                    match segment {
                        Segment::Literal(literal) => {
                            if literal != part {
                                return false;
                            }
                        }
                        Segment::Param(name) => {
                            if part.is_empty() {
                                return false;
                            }
                            params.insert(name.clone(), part.to_string());
                        }
                    }
                }

                true
            }
        }
    }
}

/// Immutable route table entry
#[derive(Debug, Clone)]
pub struct Route {
    pattern: Pattern,
    host: Option<String>,
    /// `None` matches every method
    method: Option<Method>,
    pub priority: u8,
    pub kind: RouteKind,
}

impl Route {
    pub fn new(
        path: &str,
        host: Option<String>,
        method: Option<Method>,
        priority: u8,
        kind: RouteKind,
    ) -> Self {
        Self {
            pattern: Pattern::parse(path),
            host,
            method,
            priority,
            kind,
        }
    }

    fn from_config(config: &RouteConfig) -> Self {
        let method = config
            .method
            .as_deref()
            .filter(|m| !m.eq_ignore_ascii_case("any"))
            .and_then(|m| m.to_uppercase().parse::<Method>().ok());

        let kind = match config.kind {
            RouteKindConfig::Static => RouteKind::Static,
            RouteKindConfig::Proxy => RouteKind::Proxy {
                upstream: config.upstream.clone(),
            },
            RouteKindConfig::Redirect => RouteKind::Redirect {
                location: config.location.clone().unwrap_or_default(),
                code: config.code.unwrap_or(302),
            },
            RouteKindConfig::Api => RouteKind::Api {
                handler: config.handler.clone().unwrap_or_default(),
            },
            RouteKindConfig::Websocket => RouteKind::Websocket {
                upstream: config.upstream.clone(),
            },
        };

        Route::new(
            &config.path,
            config.host.clone(),
            method,
            config.priority,
            kind,
        )
    }

    fn matches(
        &self,
        method: &Method,
        path: &str,
        host: Option<&str>,
        params: &mut HashMap<String, String>,
    ) -> bool {
        if let Some(route_method) = &self.method {
            if route_method != method {
                return false;
            }
        }

        if let Some(route_host) = &self.host {
            match host {
                Some(h) => {
                    if !route_host.eq_ignore_ascii_case(h) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        self.pattern.matches(path, params)
    }
}

/// Snapshot of one incoming request presented to the router
#[derive(Debug)]
pub struct RoutingRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    /// Host header with any port stripped
    pub host: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub client_addr: SocketAddr,
}

/// A match result: the winning route plus captured path parameters
#[derive(Debug)]
pub struct RouteDecision<'a> {
    pub route: &'a Route,
    pub params: HashMap<String, String>,
}

/// Priority-ordered route table, immutable after construction
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build a table; higher priority first, insertion order breaking ties
    pub fn new(routes: Vec<Route>) -> Self {
        let mut routes = routes;
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.routes.iter().map(Route::from_config).collect())
    }

    /// First matching route in priority order, or `None` (the pipeline turns
    /// that into a 404)
    pub fn match_request<'a>(&'a self, request: &RoutingRequest<'_>) -> Option<RouteDecision<'a>> {
        for route in &self.routes {
            let mut params = HashMap::new();
            if route.matches(request.method, request.path, request.host, &mut params) {
                debug!(path = %request.path, method = %request.method, "route matched");
                return Some(RouteDecision { route, params });
            }
        }

        debug!(path = %request.path, method = %request.method, "no route matched");
        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
