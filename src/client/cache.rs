//! Subscription-aware query cache.
//!
//! One [`QueryClient`] owns three maps: query entries (load state per
//! path), cached values, and subscribers. Independent clients share
//! nothing.
//!
//! Invariants:
//! - At most one live connection and one outstanding [`PendingLoad`] per path.
//! - A stale entry (`lazily_refetch`) never has a cached value.
//!
//! Connection callbacks are tagged with the load cycle that opened them and
//! are ignored once that cycle has been replaced. Connections are closed
//! only after the entry lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::client::connection::{ConnectionEvents, RecoverableConnection};
use crate::client::error::ClientError;
use crate::client::payload::Payload;
use crate::client::pending::{LoadError, LoadResolver, PendingLoad};
use crate::client::registry::{Listener, SubscriberRegistry, Subscription, DEFAULT_TEARDOWN_GRACE};
use crate::client::transport::{Connector, WsConnector};
use crate::config::ClientConfig;
use crate::resilience::ReconnectPolicy;
use crate::routing::{Params, RoutePattern};

/// Where to connect for a fresh load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub url: String,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Connect options, fixed or computed on every fresh load.
#[derive(Clone)]
pub enum OptionsSource {
    Static(ConnectOptions),
    Dynamic(Arc<dyn Fn() -> ConnectOptions + Send + Sync>),
}

impl OptionsSource {
    fn resolve(&self) -> ConnectOptions {
        match self {
            OptionsSource::Static(options) => options.clone(),
            OptionsSource::Dynamic(f) => f(),
        }
    }
}

/// Result of a synchronous read.
#[derive(Debug, Clone)]
pub enum Snapshot {
    /// The latest value.
    Ready(Value),
    /// No value yet; await the handle, then read again.
    Pending(PendingLoad),
    /// No value yet and the caller asked not to wait.
    Empty,
}

impl Snapshot {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Snapshot::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Snapshot::Pending(_))
    }
}

struct QueryEntry {
    cycle: u64,
    pending: PendingLoad,
    resolver: Arc<LoadResolver>,
    lazily_refetch: bool,
    connection: Option<RecoverableConnection>,
}

struct ClientInner {
    options: OptionsSource,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    queries: Mutex<HashMap<String, QueryEntry>>,
    values: DashMap<String, Payload>,
    registry: Arc<SubscriberRegistry>,
    cycles: AtomicU64,
}

impl ClientInner {
    fn queries(&self) -> MutexGuard<'_, HashMap<String, QueryEntry>> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client-side cache of live subscriptions.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// Client for the configured URL with the configured timings.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::builder()
            .url(config.url.clone())
            .reconnect_delay(Duration::from_millis(config.reconnect_delay_ms))
            .teardown_grace(Duration::from_millis(config.teardown_grace_ms))
            .build()
    }

    /// Start loading `path` unless a live load already exists.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn load(&self, path: &str) {
        if self.is_stale(path) == Some(false) {
            return;
        }
        // Resolved outside the queries lock; url functions may read this client.
        let options = self.inner.options.resolve();

        let replaced = {
            let mut queries = self.inner.queries();
            if let Some(entry) = queries.get(path) {
                if !entry.lazily_refetch {
                    return;
                }
            }

            let cycle = self.inner.cycles.fetch_add(1, Ordering::Relaxed) + 1;
            let (pending, resolver) = PendingLoad::new();
            let events = Arc::new(CycleEvents {
                client: Arc::downgrade(&self.inner),
                path: path.to_string(),
                cycle,
            });
            let connection = RecoverableConnection::open(
                path,
                options.url.clone(),
                Arc::clone(&self.inner.connector),
                events,
                self.inner.policy,
            );
            tracing::debug!(path = %path, url = %options.url, cycle = cycle, "Loading query");

            queries
                .insert(
                    path.to_string(),
                    QueryEntry {
                        cycle,
                        pending,
                        resolver: Arc::new(resolver),
                        lazily_refetch: false,
                        connection: Some(connection),
                    },
                )
                .and_then(|old| old.connection)
        };
        drop(replaced);
    }

    /// Read the current value of a loaded path.
    ///
    /// A stale entry is reloaded first. With no value yet, `suspend`
    /// chooses between [`Snapshot::Pending`] and [`Snapshot::Empty`].
    pub fn read(&self, path: &str, suspend: bool) -> Result<Snapshot, ClientError> {
        match self.is_stale(path) {
            None => return Err(not_loaded(path)),
            Some(true) => self.load(path),
            Some(false) => {}
        }

        let queries = self.inner.queries();
        let entry = queries.get(path).ok_or_else(|| not_loaded(path))?;
        match self.inner.values.get(path).map(|entry| entry.value().clone()) {
            Some(Payload::Data(value)) => Ok(Snapshot::Ready(value)),
            Some(Payload::Error(detail)) => Err(ClientError::Payload {
                path: path.to_string(),
                detail,
            }),
            None => match entry.pending.error() {
                Some(source) => Err(ClientError::Load {
                    path: path.to_string(),
                    source,
                }),
                None if suspend => Ok(Snapshot::Pending(entry.pending.clone())),
                None => Ok(Snapshot::Empty),
            },
        }
    }

    /// Wait until `path` has a value (or fails) and return it.
    pub async fn resolve(&self, path: &str) -> Result<Value, ClientError> {
        loop {
            match self.read(path, true)? {
                Snapshot::Ready(value) => return Ok(value),
                Snapshot::Pending(pending) => {
                    if let Err(source) = pending.await {
                        return Err(ClientError::Load {
                            path: path.to_string(),
                            source,
                        });
                    }
                }
                Snapshot::Empty => tokio::task::yield_now().await,
            }
        }
    }

    /// Listen for every update of a loaded path.
    pub fn subscribe<F>(&self, path: &str, listener: F) -> Result<Subscription, ClientError>
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        if self.is_stale(path).is_none() {
            return Err(not_loaded(path));
        }
        let listener: Listener = Arc::new(listener);
        Ok(self.inner.registry.subscribe(path, listener))
    }

    /// Drop the cached value, mark the entry stale and close its connection.
    pub fn invalidate(&self, path: &str) {
        let connection = {
            let mut queries = self.inner.queries();
            let Some(entry) = queries.get_mut(path) else {
                return;
            };
            self.inner.values.remove(path);
            entry.lazily_refetch = true;
            entry.resolver.reject(LoadError::Abandoned);
            entry.connection.take()
        };
        tracing::debug!(path = %path, "Query invalidated");
        if let Some(connection) = connection {
            connection.close();
        }
    }

    /// `None` when the path was never loaded.
    pub fn is_stale(&self, path: &str) -> Option<bool> {
        self.inner
            .queries()
            .get(path)
            .map(|entry| entry.lazily_refetch)
    }

    /// Whether a connection is attached to the path's entry.
    pub fn is_connected(&self, path: &str) -> bool {
        self.inner
            .queries()
            .get(path)
            .map(|entry| entry.connection.is_some())
            .unwrap_or(false)
    }

    /// Last payload received for the path, if any.
    pub fn cached(&self, path: &str) -> Option<Payload> {
        self.inner.values.get(path).map(|entry| entry.value().clone())
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.inner.registry.listener_count(path)
    }

    /// Build the canonical path for a route pattern and its params.
    pub fn path_for(&self, route: &str, params: &Params) -> Result<String, ClientError> {
        Ok(RoutePattern::compile(route)?.to_path(params)?)
    }

    /// Start loading a route without reading it. Returns the path.
    pub fn preload_subscription(&self, route: &str, params: &Params) -> Result<String, ClientError> {
        let path = self.path_for(route, params)?;
        self.load(&path);
        Ok(path)
    }

    /// Read a route that was preloaded.
    pub fn use_subscription(&self, route: &str, params: &Params) -> Result<Snapshot, ClientError> {
        let path = self.path_for(route, params)?;
        self.read(&path, true)
    }

    /// Load a route if needed, then read it.
    pub fn use_lazy_subscription(
        &self,
        route: &str,
        params: &Params,
    ) -> Result<Snapshot, ClientError> {
        let path = self.path_for(route, params)?;
        self.load(&path);
        self.read(&path, true)
    }

    /// Forget a route's value; the next access reloads it.
    pub fn clear_query(&self, route: &str, params: &Params) -> Result<(), ClientError> {
        let path = self.path_for(route, params)?;
        self.invalidate(&path);
        Ok(())
    }
}

fn not_loaded(path: &str) -> ClientError {
    ClientError::NotLoaded {
        path: path.to_string(),
    }
}

/// Connection callbacks for one load cycle of one path.
struct CycleEvents {
    client: Weak<ClientInner>,
    path: String,
    cycle: u64,
}

impl ConnectionEvents for CycleEvents {
    fn on_message(&self, payload: Payload) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        {
            let queries = client.queries();
            let Some(entry) = queries.get(&self.path) else {
                return;
            };
            if entry.cycle != self.cycle || entry.lazily_refetch {
                return;
            }
            client.values.insert(self.path.clone(), payload.clone());
            entry.resolver.resolve();
        }
        client.registry.notify(&self.path, &payload);
    }

    fn on_error(&self, detail: String) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let queries = client.queries();
        if let Some(entry) = queries.get(&self.path) {
            if entry.cycle == self.cycle {
                entry.resolver.reject(LoadError::Connection(detail));
            }
        }
    }

    fn on_close(&self, code: u16) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let connection = {
            let mut queries = client.queries();
            let Some(entry) = queries.get_mut(&self.path) else {
                return;
            };
            if entry.cycle != self.cycle || entry.lazily_refetch {
                return;
            }
            client.values.remove(&self.path);
            entry.lazily_refetch = true;
            entry.resolver.reject(LoadError::Closed(code));
            entry.connection.take()
        };
        tracing::debug!(path = %self.path, code = code, "Query marked stale");
        drop(connection);
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    options: OptionsSource,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    teardown_grace: Duration,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self {
            options: OptionsSource::Static(ConnectOptions::new(ClientConfig::default().url)),
            connector: Arc::new(WsConnector),
            reconnect_delay: ReconnectPolicy::default().delay(),
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }
}

impl QueryClientBuilder {
    /// Connect every load to the same URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options = OptionsSource::Static(ConnectOptions::new(url));
        self
    }

    /// Compute the connect options on every fresh load.
    pub fn url_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> ConnectOptions + Send + Sync + 'static,
    {
        self.options = OptionsSource::Dynamic(Arc::new(f));
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn build(self) -> QueryClient {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let client = weak.clone();
            let registry = SubscriberRegistry::new(
                self.teardown_grace,
                Arc::new(move |path: &str| {
                    if let Some(inner) = client.upgrade() {
                        QueryClient { inner }.invalidate(path);
                    }
                }),
            );
            ClientInner {
                options: self.options,
                connector: self.connector,
                policy: ReconnectPolicy::fixed(self.reconnect_delay),
                queries: Mutex::new(HashMap::new()),
                values: DashMap::new(),
                registry,
                cycles: AtomicU64::new(0),
            }
        });
        QueryClient { inner }
    }
}
