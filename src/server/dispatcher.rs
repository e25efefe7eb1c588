//! Per-connection route resolution.
//!
//! # Responsibilities
//! - Match the subscription path against the ordered route table
//! - Run the middleware chain for route and event invocations
//! - Ask the matched route's handler for a stream (or a rejection)
//!
//! # Connection States
//! ```text
//! AwaitingPath → Matched → Streaming → Closed
//! AwaitingPath → Unmatched → Closed
//! ```
//!
//! # Design Decisions
//! - The dispatcher holds no per-connection state; it is shared via Arc
//! - Route handlers are invoked once per connection, with no cross-connection
//!   deduplication

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

use crate::middleware::{
    EventInvocation, Flow, FrozenChain, MiddlewareContext, MiddlewareError, RouteInvocation,
};
use crate::net::ConnectionId;
use crate::routing::{RouteMatch, Router};
use crate::server::sink::SubscriptionSink;

/// Emitted when a socket opens, before its path frame is read.
pub const EVENT_CONNECTION: &str = "connection";
/// Emitted after a socket has ended, whatever the outcome.
pub const EVENT_CLOSE: &str = "close";

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    AwaitingPath,
    Matched,
    Streaming,
    Unmatched,
    Closed,
}

/// A per-connection streaming callback.
pub struct StreamHandler(Box<dyn FnOnce(SubscriptionSink) -> BoxFuture<'static, ()> + Send>);

impl StreamHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(SubscriptionSink) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move |sink| f(sink).boxed()))
    }

    pub(crate) fn run(self, sink: SubscriptionSink) -> BoxFuture<'static, ()> {
        (self.0)(sink)
    }
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamHandler")
    }
}

/// Route handler factory.
///
/// Called once per matched connection. Returning `None` rejects the
/// subscription and the connection is closed.
pub trait RouteHandler: Send + Sync + 'static {
    fn open(&self, route: &RouteMatch) -> Option<StreamHandler>;
}

impl<F> RouteHandler for F
where
    F: Fn(&RouteMatch) -> Option<StreamHandler> + Send + Sync + 'static,
{
    fn open(&self, route: &RouteMatch) -> Option<StreamHandler> {
        self(route)
    }
}

/// A handler that accepts every matched connection and runs `f` for it.
pub fn stream<F, Fut>(f: F) -> impl RouteHandler
where
    F: Fn(SubscriptionSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    move |_route: &RouteMatch| {
        let f = Arc::clone(&f);
        Some(StreamHandler::new(move |sink| f(sink)))
    }
}

pub type EventListener = Arc<dyn Fn(&EventInvocation) + Send + Sync>;

/// Errors that fail a connection during dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error("middleware replaced a route invocation with an event")]
    ContextMismatch,

    #[error("dispatch panicked: {0}")]
    Panicked(String),
}

/// Result of resolving a subscription path.
#[derive(Debug)]
pub enum Resolution {
    /// Matched, admitted by middleware, accepted by the handler.
    Stream {
        route: RouteMatch,
        handler: StreamHandler,
    },
    /// No route matched the path.
    Unmatched,
    /// A middleware did not call `next`.
    Halted,
    /// The handler factory declined the subscription.
    Rejected { route: RouteMatch },
}

impl Resolution {
    pub fn phase(&self) -> ConnectionPhase {
        match self {
            Resolution::Stream { .. } => ConnectionPhase::Matched,
            Resolution::Unmatched => ConnectionPhase::Unmatched,
            Resolution::Halted | Resolution::Rejected { .. } => ConnectionPhase::Closed,
        }
    }

    /// Label used for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Resolution::Stream { .. } => "streaming",
            Resolution::Unmatched => "unmatched",
            Resolution::Halted => "halted",
            Resolution::Rejected { .. } => "rejected",
        }
    }
}

/// Shared, immutable dispatch table.
pub struct Dispatcher {
    router: Router<Arc<dyn RouteHandler>>,
    chain: FrozenChain,
    listeners: HashMap<String, Vec<EventListener>>,
}

impl Dispatcher {
    pub fn new(
        router: Router<Arc<dyn RouteHandler>>,
        chain: FrozenChain,
        listeners: HashMap<String, Vec<EventListener>>,
    ) -> Self {
        Self {
            router,
            chain,
            listeners,
        }
    }

    pub fn router(&self) -> &Router<Arc<dyn RouteHandler>> {
        &self.router
    }

    /// Resolve the path a connection asked for.
    ///
    /// A panic in a middleware or handler factory becomes
    /// [`DispatchError::Panicked`].
    pub async fn resolve(
        &self,
        connection: ConnectionId,
        path: &str,
    ) -> Result<Resolution, DispatchError> {
        contain(self.resolve_path(connection, path)).await
    }

    async fn resolve_path(
        &self,
        connection: ConnectionId,
        path: &str,
    ) -> Result<Resolution, DispatchError> {
        let Some((handler, matched)) = self.router.match_path(path) else {
            tracing::debug!(connection_id = %connection, path = %path, "No route matched");
            return Ok(Resolution::Unmatched);
        };
        let handler = Arc::clone(handler);

        tracing::debug!(
            connection_id = %connection,
            path = %path,
            pattern = %matched.pattern,
            "Route matched"
        );

        let ctx = MiddlewareContext::Route(RouteInvocation {
            connection,
            path: matched.path,
            pattern: matched.pattern,
            params: matched.params,
        });

        let reached = match self.chain.run(ctx).await? {
            Flow::Proceed(reached) => reached,
            Flow::Halt => return Ok(Resolution::Halted),
        };

        let MiddlewareContext::Route(invocation) = reached.into_context() else {
            return Err(DispatchError::ContextMismatch);
        };
        let route = RouteMatch {
            path: invocation.path,
            pattern: invocation.pattern,
            params: invocation.params,
        };

        match handler.open(&route) {
            Some(handler) => Ok(Resolution::Stream { route, handler }),
            None => Ok(Resolution::Rejected { route }),
        }
    }

    /// Run an event through the middleware chain, then its listeners.
    ///
    /// Returns `Ok(false)` when a middleware halted the event.
    pub async fn emit(&self, connection: ConnectionId, name: &str) -> Result<bool, DispatchError> {
        contain(self.emit_event(connection, name)).await
    }

    async fn emit_event(&self, connection: ConnectionId, name: &str) -> Result<bool, DispatchError> {
        let ctx = MiddlewareContext::Event(EventInvocation {
            connection,
            name: name.to_string(),
        });

        let reached = match self.chain.run(ctx).await? {
            Flow::Proceed(reached) => reached,
            Flow::Halt => return Ok(false),
        };
        let MiddlewareContext::Event(event) = reached.into_context() else {
            return Err(DispatchError::ContextMismatch);
        };

        if let Some(listeners) = self.listeners.get(&event.name) {
            for listener in listeners {
                listener(&event);
            }
        }
        Ok(true)
    }
}

async fn contain<T>(
    dispatch: impl Future<Output = Result<T, DispatchError>>,
) -> Result<T, DispatchError> {
    match AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
