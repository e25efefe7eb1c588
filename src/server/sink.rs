//! Outbound half of a streaming subscription.

use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::net::ConnectionId;
use crate::routing::RouteMatch;

/// Errors returned when writing to a subscriber.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("subscriber disconnected")]
    Disconnected,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Frames queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle a route handler uses to push data to one subscribed connection.
///
/// Dropping the sink (or returning from the handler) ends the stream with a
/// normal closure.
#[derive(Debug)]
pub struct SubscriptionSink {
    connection: ConnectionId,
    route: RouteMatch,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SubscriptionSink {
    pub(crate) fn new(
        connection: ConnectionId,
        route: RouteMatch,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connection,
                route,
                tx,
            },
            rx,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// The matched route, including params added by middleware.
    pub fn route(&self) -> &RouteMatch {
        &self.route
    }

    /// Get a route parameter parsed into `T`.
    pub fn param<T: FromStr>(&self, name: &str) -> Option<T> {
        self.route.param(name)
    }

    /// Send a JSON payload.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), SinkError> {
        let text = serde_json::to_string(payload)?;
        self.send_text(text)
    }

    /// Send an error payload (`{"error": detail}`), which the client treats
    /// as a terminal error value for its current load.
    pub fn send_error(&self, detail: impl Into<String>) -> Result<(), SinkError> {
        let detail: String = detail.into();
        self.send(&serde_json::json!({ "error": detail }))
    }

    /// Send an already encoded frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SinkError> {
        self.tx
            .send(Outbound::Text(text.into()))
            .map_err(|_| SinkError::Disconnected)
    }

    /// True once the subscriber has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the subscriber has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// End the stream with a specific close code.
    pub fn close_with(self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Params;

    fn sink() -> (SubscriptionSink, mpsc::UnboundedReceiver<Outbound>) {
        let mut params = Params::new();
        params.insert("id".into(), "42".into());
        SubscriptionSink::new(
            ConnectionId::new(),
            RouteMatch {
                path: "/rooms/42".into(),
                pattern: "/rooms/:id".into(),
                params,
            },
        )
    }

    #[test]
    fn test_send_encodes_json() {
        let (sink, mut rx) = sink();
        sink.send(&serde_json::json!({ "users": 3 })).unwrap();
        sink.send_error("room closed").unwrap();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Text(r#"{"users":3}"#.into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Text(r#"{"error":"room closed"}"#.into())
        );
        assert_eq!(sink.param::<u32>("id"), Some(42));
    }

    #[test]
    fn test_send_fails_after_disconnect() {
        let (sink, rx) = sink();
        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(sink.send_text("x"), Err(SinkError::Disconnected)));
    }

    #[test]
    fn test_close_with_queues_close_frame() {
        let (sink, mut rx) = sink();
        sink.close_with(4000, "done");
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: 4000,
                reason: "done".into()
            }
        );
        // Sink dropped: channel ends.
        assert!(rx.try_recv().is_err());
    }
}
