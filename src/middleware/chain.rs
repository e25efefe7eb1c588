//! Ordered middleware dispatch with explicit continuations.
//!
//! A middleware receives the invocation context and a [`Next`]. Calling
//! `next.run(ctx)` hands control to the rest of the chain; returning without
//! calling it short-circuits, and the route or event handler never runs.
//!
//! `Next` is consumed by `run`, so a continuation can be taken at most once.
//! Only the end of the chain can produce [`Flow::Proceed`], so a middleware
//! cannot claim completion without actually running its continuation.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

use crate::net::ConnectionId;
use crate::routing::Params;

/// Failure raised by a middleware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MiddlewareError {
    #[error("rejected by middleware: {0}")]
    Rejected(String),

    #[error("middleware failed: {0}")]
    Failed(String),
}

/// A route invocation: a connection asking for a subscription path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInvocation {
    pub connection: ConnectionId,
    pub path: String,
    pub pattern: String,
    pub params: Params,
}

/// An event invocation (`connection`, `close`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInvocation {
    pub connection: ConnectionId,
    pub name: String,
}

/// What is being dispatched through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareContext {
    Route(RouteInvocation),
    Event(EventInvocation),
}

impl MiddlewareContext {
    pub fn connection(&self) -> ConnectionId {
        match self {
            MiddlewareContext::Route(r) => r.connection,
            MiddlewareContext::Event(e) => e.connection,
        }
    }
}

/// Proof that every middleware ran its continuation.
///
/// Carries the context as the last middleware left it.
#[derive(Debug)]
pub struct Reached {
    ctx: MiddlewareContext,
}

impl Reached {
    pub fn context(&self) -> &MiddlewareContext {
        &self.ctx
    }

    pub fn into_context(self) -> MiddlewareContext {
        self.ctx
    }
}

/// Outcome of running the chain.
#[derive(Debug)]
pub enum Flow {
    /// The end of the chain was reached; the handler should run.
    Proceed(Reached),
    /// Some middleware did not call `next`.
    Halt,
}

impl Flow {
    pub fn is_halt(&self) -> bool {
        matches!(self, Flow::Halt)
    }
}

pub type MiddlewareResult = Result<Flow, MiddlewareError>;

/// An interceptor around route and event dispatch.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: MiddlewareContext, next: Next) -> BoxFuture<'static, MiddlewareResult>;
}

impl<F, Fut> Middleware for F
where
    F: Fn(MiddlewareContext, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    fn call(&self, ctx: MiddlewareContext, next: Next) -> BoxFuture<'static, MiddlewareResult> {
        self(ctx, next).boxed()
    }
}

/// The remainder of the chain after the current middleware.
pub struct Next {
    stack: Arc<[Arc<dyn Middleware>]>,
    index: usize,
}

impl Next {
    /// Run the rest of the chain.
    pub async fn run(self, ctx: MiddlewareContext) -> MiddlewareResult {
        match self.stack.get(self.index) {
            Some(middleware) => {
                let middleware = Arc::clone(middleware);
                let next = Next {
                    stack: Arc::clone(&self.stack),
                    index: self.index + 1,
                };
                middleware.call(ctx, next).await
            }
            None => Ok(Flow::Proceed(Reached { ctx })),
        }
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("len", &self.stack.len())
            .finish()
    }
}

/// Registration-ordered middleware stack.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stack: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs after every previously added one.
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.stack.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.stack.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Freeze the current stack for dispatch.
    pub fn freeze(&self) -> FrozenChain {
        FrozenChain {
            stack: self.stack.clone().into(),
        }
    }
}

/// An immutable chain, cheap to share between connections.
#[derive(Clone)]
pub struct FrozenChain {
    stack: Arc<[Arc<dyn Middleware>]>,
}

impl FrozenChain {
    /// Dispatch `ctx` through every middleware in order.
    pub async fn run(&self, ctx: MiddlewareContext) -> MiddlewareResult {
        Next {
            stack: Arc::clone(&self.stack),
            index: 0,
        }
        .run(ctx)
        .await
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}
