//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use live_sync::config::LiveSyncConfig;
use live_sync::lifecycle::Shutdown;
use live_sync::net::ConnectionTracker;
use live_sync::routing::Params;
use live_sync::server::{ServerBuilder, ServerError, SubscriptionServer};
use live_sync::QueryClient;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A server bound to an ephemeral local port.
pub struct TestServer {
    pub url: String,
    pub shutdown: Shutdown,
    pub tracker: ConnectionTracker,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    /// A client with real websocket transport and a short retry delay.
    pub fn client(&self) -> QueryClient {
        QueryClient::builder()
            .url(self.url.clone())
            .reconnect_delay(Duration::from_millis(100))
            .build()
    }

    /// Trigger shutdown and wait for `run` to return.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
    }
}

pub async fn start_server(configure: impl FnOnce(ServerBuilder) -> ServerBuilder) -> TestServer {
    start_server_with(LiveSyncConfig::default(), configure).await
}

pub async fn start_server_with(
    config: LiveSyncConfig,
    configure: impl FnOnce(ServerBuilder) -> ServerBuilder,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let endpoint = config.socket.endpoint.clone();

    let server = configure(SubscriptionServer::builder(config)).build();
    let tracker = server.tracker().clone();
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestServer {
        url: format!("ws://{addr}{endpoint}"),
        shutdown,
        tracker,
        handle,
    }
}

pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Poll `condition` until it holds or about two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
