//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes in declaration order
//! - Look up the first route matching a request path
//! - Return the matched route with its params, or an explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan over routes (acceptable for typical route counts)
//! - First match wins, even when a later route is more specific

use std::str::FromStr;

use serde::Serialize;

use crate::routing::matcher::{Params, PatternError, RoutePattern};

/// A successful route match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMatch {
    /// The concrete path requested by the client.
    pub path: String,
    /// The pattern of the route that matched.
    pub pattern: String,
    /// Parameters extracted from the path.
    pub params: Params,
}

impl RouteMatch {
    /// Get a parameter parsed into `T`.
    ///
    /// Returns `None` when the parameter is absent or does not parse.
    pub fn param<T: FromStr>(&self, name: &str) -> Option<T> {
        self.params.get(name).and_then(|v| v.parse().ok())
    }
}

/// Ordered, immutable route table.
#[derive(Debug)]
pub struct Router<H> {
    routes: Vec<(RoutePattern, H)>,
}

impl<H> Router<H> {
    /// Start building a router.
    pub fn builder() -> RouterBuilder<H> {
        RouterBuilder { routes: Vec::new() }
    }

    /// Find the first route matching `path`.
    pub fn match_path(&self, path: &str) -> Option<(&H, RouteMatch)> {
        self.routes.iter().find_map(|(pattern, handler)| {
            pattern.match_path(path).map(|params| {
                (
                    handler,
                    RouteMatch {
                        path: path.to_string(),
                        pattern: pattern.as_str().to_string(),
                        params,
                    },
                )
            })
        })
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered patterns in match order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(p, _)| p.as_str())
    }
}

/// Collects routes before freezing them into a [`Router`].
#[derive(Debug)]
pub struct RouterBuilder<H> {
    routes: Vec<(RoutePattern, H)>,
}

impl<H> RouterBuilder<H> {
    /// Register a route. Routes are matched in registration order.
    pub fn route(mut self, pattern: &str, handler: H) -> Result<Self, PatternError> {
        let compiled = RoutePattern::compile(pattern)?;
        self.routes.push((compiled, handler));
        Ok(self)
    }

    pub fn build(self) -> Router<H> {
        Router {
            routes: self.routes,
        }
    }
}
