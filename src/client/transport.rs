//! Socket transport seam.
//!
//! A [`Connector`] hands back a [`Socket`] immediately; whether the socket
//! opened, failed or closed is reported afterwards as [`SocketEvent`]s, in
//! the order a browser websocket would report them. The production
//! connector is [`WsConnector`]; tests plug in an in-memory one.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a status code (a local `close()` with no code).
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Abnormal closure: the socket dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Something the socket reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Frame(String),
    Error(String),
    Closed(u16),
}

/// Something the owner asks the socket to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close,
}

/// Owner side of a socket.
#[derive(Debug)]
pub struct Socket {
    commands: mpsc::UnboundedSender<ClientFrame>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Transport side of a socket, driven by a connector.
#[derive(Debug)]
pub struct SocketPeer {
    pub events: mpsc::UnboundedSender<SocketEvent>,
    pub commands: mpsc::UnboundedReceiver<ClientFrame>,
}

impl Socket {
    /// Create a connected owner/transport pair.
    pub fn pair() -> (Socket, SocketPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Socket {
                commands: command_tx,
                events: event_rx,
            },
            SocketPeer {
                events: event_tx,
                commands: command_rx,
            },
        )
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientFrame>,
        mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        (self.commands, self.events)
    }
}

/// Opens sockets to a URL.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> Socket;
}

/// `tokio-tungstenite` websocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> Socket {
        let (socket, peer) = Socket::pair();
        tokio::spawn(pump(url.to_string(), peer));
        socket
    }
}

async fn pump(url: String, peer: SocketPeer) {
    let SocketPeer {
        events,
        mut commands,
    } = peer;

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            tracing::debug!(url = %url, error = %err, "Socket connect failed");
            let _ = events.send(SocketEvent::Error(err.to_string()));
            let _ = events.send(SocketEvent::Closed(CLOSE_ABNORMAL));
            return;
        }
    };
    let _ = events.send(SocketEvent::Open);
    let (mut write, mut read) = stream.split();

    let code = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ClientFrame::Text(text)) => {
                    if let Err(err) = write.send(Message::Text(text.into())).await {
                        let _ = events.send(SocketEvent::Error(err.to_string()));
                        break CLOSE_ABNORMAL;
                    }
                }
                Some(ClientFrame::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break CLOSE_NO_STATUS;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Frame(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    let _ = events.send(SocketEvent::Frame(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(SocketEvent::Error(err.to_string()));
                    break CLOSE_ABNORMAL;
                }
                None => break CLOSE_ABNORMAL,
            }
        }
    };

    tracing::debug!(url = %url, code = code, "Socket closed");
    let _ = events.send(SocketEvent::Closed(code));
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockSocket {
        url: String,
        peer: SocketPeer,
    }

    /// Records every connect and lets a test play the server side.
    #[derive(Clone, Default)]
    pub(crate) struct MockConnector {
        sockets: Arc<Mutex<Vec<MockSocket>>>,
    }

    impl MockConnector {
        pub(crate) fn connects(&self) -> usize {
            self.sockets.lock().unwrap().len()
        }

        pub(crate) fn url(&self, index: usize) -> String {
            self.sockets.lock().unwrap()[index].url.clone()
        }

        pub(crate) fn emit(&self, index: usize, event: SocketEvent) {
            let sockets = self.sockets.lock().unwrap();
            let _ = sockets[index].peer.events.send(event);
        }

        pub(crate) fn drain_outbound(&self, index: usize) -> Vec<ClientFrame> {
            let mut sockets = self.sockets.lock().unwrap();
            let mut frames = Vec::new();
            while let Ok(frame) = sockets[index].peer.commands.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, url: &str) -> Socket {
            let (socket, peer) = Socket::pair();
            self.sockets.lock().unwrap().push(MockSocket {
                url: url.to_string(),
                peer,
            });
            socket
        }
    }
}
