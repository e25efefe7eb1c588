//! Server-side subscription dispatch.
//!
//! # Data Flow
//! ```text
//! Socket upgrade → ConnectionTracker (limit) → "connection" event
//!     → read path frame → Router match → Middleware chain
//!     → RouteHandler::open → StreamHandler(SubscriptionSink) → JSON frames
//!     → close frame → "close" event
//! ```
//!
//! # Design Decisions
//! - The route table and middleware chain are frozen at `build()` and shared
//!   read-only by every connection task
//! - One tokio task per socket; the route handler runs in its own task so a
//!   client disconnect can abort it
//! - The client never writes after the path frame; later frames are ignored

pub mod dispatcher;
pub mod endpoint;
pub mod sink;

pub use dispatcher::{
    stream, ConnectionPhase, DispatchError, Dispatcher, EventListener, Resolution, RouteHandler,
    StreamHandler, EVENT_CLOSE, EVENT_CONNECTION,
};
pub use endpoint::{
    ServerBuilder, ServerError, SubscriptionServer, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR,
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
pub use sink::{SinkError, SubscriptionSink};
