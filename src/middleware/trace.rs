//! Tracing middleware.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::middleware::chain::{Middleware, MiddlewareContext, MiddlewareResult, Next};

/// Logs every route and event invocation and how the rest of the chain ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceMiddleware;

impl Middleware for TraceMiddleware {
    fn call(&self, ctx: MiddlewareContext, next: Next) -> BoxFuture<'static, MiddlewareResult> {
        async move {
            let connection = ctx.connection();
            match &ctx {
                MiddlewareContext::Route(route) => tracing::info!(
                    connection_id = %connection,
                    path = %route.path,
                    pattern = %route.pattern,
                    "Route invocation"
                ),
                MiddlewareContext::Event(event) => tracing::debug!(
                    connection_id = %connection,
                    event = %event.name,
                    "Event invocation"
                ),
            }

            let result = next.run(ctx).await;
            match &result {
                Ok(flow) if flow.is_halt() => {
                    tracing::info!(connection_id = %connection, "Chain halted")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(connection_id = %connection, error = %e, "Chain failed"),
            }
            result
        }
        .boxed()
    }
}
