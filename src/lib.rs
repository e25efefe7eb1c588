//! Live Sync Library
//!
//! Server-pushed data bound to named routes over websockets, with a
//! client-side cache that deduplicates loads, reconnects after abnormal
//! closures and tears connections down once nobody listens.

// Shared
pub mod config;
pub mod routing;

// Server
pub mod middleware;
pub mod net;
pub mod server;

// Client
pub mod client;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use client::{ClientError, QueryClient, Snapshot, Subscription};
pub use config::LiveSyncConfig;
pub use lifecycle::Shutdown;
pub use middleware::{Middleware, MiddlewareChain, MiddlewareContext, Next, TraceMiddleware};
pub use routing::{Params, RouteMatch, RoutePattern};
pub use server::{StreamHandler, SubscriptionServer, SubscriptionSink};
