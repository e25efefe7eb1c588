//! Middleware subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher builds a MiddlewareContext (route or event)
//!     → chain.rs runs middleware in registration order
//!     → each middleware: inspect / augment ctx, then next.run(ctx) or stop
//!     → Flow::Proceed(ctx) → handler runs with the final ctx
//!     → Flow::Halt          → handler skipped, route connection closed
//!     → Err(_)              → connection treated as failed
//! ```
//!
//! # Design Decisions
//! - Continuations are values consumed by `run` (single use)
//! - Only the chain end produces `Proceed` (first short-circuit wins)
//! - Chain frozen at startup and shared across connections

pub mod chain;
pub mod trace;

pub use chain::{
    EventInvocation, Flow, FrozenChain, Middleware, MiddlewareChain, MiddlewareContext,
    MiddlewareError, MiddlewareResult, Next, Reached, RouteInvocation,
};
pub use trace::TraceMiddleware;
