//! A socket bound to one path that retries once per abnormal closure.
//!
//! # Connection States
//! ```text
//! Connecting → Open → Closed(1006) → (delay) → Connecting → ...
//!                   → Closed(other) → on_close
//! close() from any state → Closed (final)
//! ```
//!
//! Every physical socket gets a new epoch. Events from an older socket and
//! retry timers scheduled for an older epoch are dropped, so a late timer
//! can never open a second socket.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::payload::Payload;
use crate::client::transport::{ClientFrame, Connector, SocketEvent, CLOSE_ABNORMAL};
use crate::observability::metrics;
use crate::resilience::ReconnectPolicy;

/// Callbacks a [`RecoverableConnection`] reports to.
pub trait ConnectionEvents: Send + Sync + 'static {
    /// A decoded inbound frame; undecodable frames arrive as errors.
    fn on_message(&self, payload: Payload);
    /// A socket-level error. The socket is not closed by this.
    fn on_error(&self, detail: String);
    /// A closure that will not be retried.
    fn on_close(&self, code: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

struct State {
    status: ConnectionStatus,
    epoch: u64,
    shut: bool,
    writer: Option<mpsc::UnboundedSender<ClientFrame>>,
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    path: String,
    url: String,
    connector: Arc<dyn Connector>,
    events: Arc<dyn ConnectionEvents>,
    policy: ReconnectPolicy,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.lock();
        !state.shut && state.epoch == epoch
    }
}

/// Handle to the logical connection for one path.
///
/// Dropping the handle closes it.
pub struct RecoverableConnection {
    inner: Arc<Inner>,
}

impl RecoverableConnection {
    /// Open a socket to `url`; `path` is sent as the first frame once open.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        path: impl Into<String>,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        events: Arc<dyn ConnectionEvents>,
        policy: ReconnectPolicy,
    ) -> Self {
        let inner = Arc::new(Inner {
            path: path.into(),
            url: url.into(),
            connector,
            events,
            policy,
            state: Mutex::new(State {
                status: ConnectionStatus::Connecting,
                epoch: 0,
                shut: false,
                writer: None,
                pump: None,
                retry: None,
            }),
        });
        connect(&inner, None);
        Self { inner }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    /// Number of physical sockets opened so far, plus one per `close`.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    /// Close for good. Cancels any scheduled retry; no callbacks follow.
    pub fn close(&self) {
        let (writer, pump, retry) = {
            let mut state = self.inner.lock();
            if state.shut {
                return;
            }
            state.shut = true;
            state.epoch += 1;
            state.status = ConnectionStatus::Closed;
            (state.writer.take(), state.pump.take(), state.retry.take())
        };

        if let Some(writer) = writer {
            let _ = writer.send(ClientFrame::Close);
        }
        if let Some(retry) = retry {
            retry.abort();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        tracing::debug!(path = %self.inner.path, "Connection closed by owner");
    }
}

impl Drop for RecoverableConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RecoverableConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RecoverableConnection")
            .field("path", &self.inner.path)
            .field("status", &state.status)
            .field("epoch", &state.epoch)
            .finish()
    }
}

/// Open a new physical socket.
///
/// With `expected`, only reconnects if the connection is still closed at
/// that epoch.
fn connect(inner: &Arc<Inner>, expected: Option<u64>) -> bool {
    let mut state = inner.lock();
    if let Some(epoch) = expected {
        if state.shut || state.epoch != epoch || state.status != ConnectionStatus::Closed {
            return false;
        }
    }

    let (writer, events) = inner.connector.connect(&inner.url).into_parts();
    state.epoch += 1;
    state.status = ConnectionStatus::Connecting;
    state.writer = Some(writer);
    state.retry = None;
    let epoch = state.epoch;
    state.pump = Some(tokio::spawn(pump(Arc::downgrade(inner), epoch, events)));
    tracing::debug!(path = %inner.path, url = %inner.url, epoch = epoch, "Connecting");
    true
}

async fn pump(inner: Weak<Inner>, epoch: u64, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            SocketEvent::Open => {
                let mut state = inner.lock();
                if state.shut || state.epoch != epoch {
                    return;
                }
                state.status = ConnectionStatus::Open;
                if let Some(writer) = &state.writer {
                    let _ = writer.send(ClientFrame::Text(inner.path.clone()));
                }
                tracing::debug!(path = %inner.path, epoch = epoch, "Socket open, path sent");
            }
            SocketEvent::Frame(text) => {
                if !inner.is_current(epoch) {
                    return;
                }
                inner.events.on_message(Payload::decode(&text));
            }
            SocketEvent::Error(detail) => {
                if !inner.is_current(epoch) {
                    return;
                }
                tracing::warn!(path = %inner.path, error = %detail, "Socket error");
                inner.events.on_error(detail);
            }
            SocketEvent::Closed(code) => {
                handle_closed(&inner, epoch, code);
                return;
            }
        }
    }

    // The transport went away without reporting a close.
    if let Some(inner) = inner.upgrade() {
        handle_closed(&inner, epoch, CLOSE_ABNORMAL);
    }
}

fn handle_closed(inner: &Arc<Inner>, epoch: u64, code: u16) {
    {
        let mut state = inner.lock();
        if state.shut || state.epoch != epoch {
            return;
        }
        state.status = ConnectionStatus::Closed;
        state.writer = None;
        state.pump = None;

        if inner.policy.should_retry(code) {
            let delay = inner.policy.delay();
            let weak = Arc::downgrade(inner);
            state.retry = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    if connect(&inner, Some(epoch)) {
                        metrics::record_reconnect();
                        tracing::info!(path = %inner.path, "Reconnected after abnormal closure");
                    }
                }
            }));
            tracing::info!(
                path = %inner.path,
                code = code,
                delay_ms = delay.as_millis() as u64,
                "Abnormal closure, retry scheduled"
            );
            return;
        }
    }

    tracing::info!(path = %inner.path, code = code, "Socket closed");
    inner.events.on_close(code);
}
