//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Subscription path (first frame of a socket)
//!     → router.rs (ordered route lookup)
//!     → matcher.rs (structural segment match, param extraction)
//!     → Return: matched handler + RouteMatch, or NoMatch
//!
//! Route Compilation (at startup):
//!     pattern strings
//!     → matcher.rs compiles literal / :param / {/:param} segments
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path
//! - Deterministic: same input always matches same route
//! - First match wins (declaration order)

pub mod matcher;
pub mod router;

pub use matcher::{Params, PatternError, RoutePattern};
pub use router::{RouteMatch, Router, RouterBuilder};
