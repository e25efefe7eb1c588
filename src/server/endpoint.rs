//! Websocket endpoint and per-connection dispatch flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::LiveSyncConfig;
use crate::middleware::{EventInvocation, Middleware, MiddlewareChain};
use crate::net::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::observability::metrics;
use crate::routing::{PatternError, RouteMatch, Router, RouterBuilder};
use crate::server::dispatcher::{
    Dispatcher, EventListener, Resolution, RouteHandler, StreamHandler, EVENT_CLOSE,
    EVENT_CONNECTION,
};
use crate::server::sink::{Outbound, SubscriptionSink};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// How long `run` waits for open sockets after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid route: {0}")]
    Pattern(#[from] PatternError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared by every socket handler.
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
    path_timeout: Duration,
    closing: broadcast::Sender<()>,
}

/// Collects routes, middleware and event listeners before the server starts.
pub struct ServerBuilder {
    config: LiveSyncConfig,
    routes: RouterBuilder<Arc<dyn RouteHandler>>,
    chain: MiddlewareChain,
    listeners: HashMap<String, Vec<EventListener>>,
}

impl ServerBuilder {
    /// Register a route. Routes are tried in registration order.
    pub fn route(mut self, pattern: &str, handler: impl RouteHandler) -> Result<Self, ServerError> {
        let handler: Arc<dyn RouteHandler> = Arc::new(handler);
        self.routes = self.routes.route(pattern, handler)?;
        Ok(self)
    }

    /// Append a middleware to the dispatch chain.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.chain = self.chain.with(middleware);
        self
    }

    /// Listen for a lifecycle event (`connection`, `close`).
    pub fn on<F>(mut self, event: &str, listener: F) -> Self
    where
        F: Fn(&EventInvocation) + Send + Sync + 'static,
    {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
        self
    }

    /// Freeze the route table and middleware chain.
    pub fn build(self) -> SubscriptionServer {
        let dispatcher = Dispatcher::new(self.routes.build(), self.chain.freeze(), self.listeners);
        SubscriptionServer {
            dispatcher: Arc::new(dispatcher),
            tracker: ConnectionTracker::new(self.config.listener.max_connections),
            config: self.config,
        }
    }
}

/// Server that streams route data to subscribed sockets.
pub struct SubscriptionServer {
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
    config: LiveSyncConfig,
}

impl SubscriptionServer {
    pub fn builder(config: LiveSyncConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            routes: Router::builder(),
            chain: MiddlewareChain::new(),
            listeners: HashMap::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve the websocket endpoint until `shutdown` fires.
    ///
    /// Open subscriptions are closed with 1001 and given a short window to
    /// drain before this returns.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let (closing, _) = broadcast::channel(1);
        let state = AppState {
            dispatcher: self.dispatcher,
            tracker: self.tracker.clone(),
            path_timeout: Duration::from_secs(self.config.socket.path_timeout_secs),
            closing: closing.clone(),
        };

        let app = axum::Router::new()
            .route(&self.config.socket.endpoint, get(upgrade_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        tracing::info!(
            address = %addr,
            endpoint = %self.config.socket.endpoint,
            max_connections = self.config.listener.max_connections,
            "Subscription server starting"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, closing subscriptions");
                let _ = closing.send(());
            })
            .await?;

        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait_for_drain())
            .await
            .is_err()
        {
            tracing::warn!(
                active = self.tracker.active_count(),
                "Subscriptions still open after drain timeout"
            );
        }

        tracing::info!("Subscription server stopped");
        Ok(())
    }
}

async fn upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(guard) = state.tracker.try_track() else {
        tracing::warn!(
            max_connections = state.tracker.max_connections(),
            "Connection limit reached, rejecting socket"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    metrics::record_connection();
    ws.on_upgrade(move |socket| serve_socket(state, socket, guard))
}

async fn serve_socket(state: AppState, mut socket: WebSocket, guard: ConnectionGuard) {
    let id = guard.id();
    let mut closing = state.closing.subscribe();
    tracing::debug!(connection_id = %id, "Socket opened");

    let outcome = match state.dispatcher.emit(id, EVENT_CONNECTION).await {
        Ok(_) => drive(&state, id, socket, &mut closing).await,
        Err(err) => {
            tracing::warn!(connection_id = %id, error = %err, "Connection event failed");
            close(&mut socket, CLOSE_INTERNAL_ERROR, "middleware failed").await;
            "failed"
        }
    };
    metrics::record_dispatch(outcome);

    if let Err(err) = state.dispatcher.emit(id, EVENT_CLOSE).await {
        tracing::warn!(connection_id = %id, error = %err, "Close event failed");
    }
    tracing::debug!(connection_id = %id, outcome = outcome, "Socket closed");
    drop(guard);
}

/// Read the path frame, resolve it and run the matched handler.
async fn drive(
    state: &AppState,
    id: ConnectionId,
    mut socket: WebSocket,
    closing: &mut broadcast::Receiver<()>,
) -> &'static str {
    let Some(path) = read_path(&mut socket, state.path_timeout).await else {
        tracing::debug!(connection_id = %id, "No subscription path received");
        close(&mut socket, CLOSE_POLICY_VIOLATION, "missing subscription path").await;
        return "no_path";
    };

    let resolution = match state.dispatcher.resolve(id, &path).await {
        Ok(resolution) => resolution,
        Err(err) => {
            tracing::warn!(connection_id = %id, path = %path, error = %err, "Dispatch failed");
            close(&mut socket, CLOSE_INTERNAL_ERROR, "middleware failed").await;
            return "failed";
        }
    };

    let outcome = resolution.outcome();
    match resolution {
        Resolution::Stream { route, handler } => {
            tracing::info!(
                connection_id = %id,
                path = %route.path,
                pattern = %route.pattern,
                "Subscription streaming"
            );
            run_stream(socket, id, route, handler, closing).await;
        }
        Resolution::Unmatched => {
            tracing::info!(connection_id = %id, path = %path, "No route for subscription");
            close(&mut socket, CLOSE_POLICY_VIOLATION, "no matching route").await;
        }
        Resolution::Halted => {
            close(&mut socket, CLOSE_POLICY_VIOLATION, "halted by middleware").await;
        }
        Resolution::Rejected { route } => {
            tracing::info!(connection_id = %id, pattern = %route.pattern, "Subscription rejected");
            close(&mut socket, CLOSE_POLICY_VIOLATION, "subscription rejected").await;
        }
    }
    outcome
}

/// The first text frame is the raw subscription path.
async fn read_path(socket: &mut WebSocket, timeout: Duration) -> Option<String> {
    let read = async {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(text) => return Some(text.as_str().to_owned()),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Binary(_) | Message::Close(_) => return None,
            }
        }
        None
    };
    tokio::time::timeout(timeout, read).await.ok().flatten()
}

/// Pump frames from the handler to the socket until either side ends.
async fn run_stream(
    socket: WebSocket,
    id: ConnectionId,
    route: RouteMatch,
    handler: StreamHandler,
    closing: &mut broadcast::Receiver<()>,
) {
    let (sink, mut outbound) = SubscriptionSink::new(id, route);
    let mut task = tokio::spawn(handler.run(sink));
    let (mut writer, mut reader) = socket.split();

    let close_frame = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if writer.send(Message::Text(text.into())).await.is_err() {
                        break None;
                    }
                }
                Some(Outbound::Close { code, reason }) => break Some((code, reason)),
                None => {
                    let code = match (&mut task).await {
                        Ok(()) => CLOSE_NORMAL,
                        Err(err) => {
                            tracing::error!(connection_id = %id, error = %err, "Route handler panicked");
                            CLOSE_INTERNAL_ERROR
                        }
                    };
                    break Some((code, String::new()));
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                // Client frames after the path are not part of the protocol.
                Some(Ok(_)) => {}
            },
            _ = closing.recv() => {
                break Some((CLOSE_GOING_AWAY, "server shutting down".to_string()));
            }
        }
    };

    task.abort();
    if let Some((code, reason)) = close_frame {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = writer.send(Message::Close(Some(frame))).await;
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
