//! Client-side subscription cache.
//!
//! # Data Flow
//! ```text
//! preload_subscription(route, params)
//!     → RoutePattern::to_path → QueryClient::load(path)
//!     → RecoverableConnection::open → Connector::connect(url)
//!     → on open: send path frame
//!     → frames: Payload::decode → value cache → PendingLoad resolved
//!       → SubscriberRegistry::notify
//!     → close 1006: retry after 1 s (value kept)
//!     → other close: value cleared, entry stale, reloaded on next read
//! last unsubscribe → grace window → connection closed, entry stale
//! ```
//!
//! # Design Decisions
//! - Reads are synchronous and return a `Snapshot`; waiting on a pending
//!   load is the caller's choice
//! - All state belongs to one `QueryClient`; clients never share maps
//! - The socket is behind the `Connector` trait so the cache runs against
//!   an in-memory transport in tests

pub mod cache;
pub mod connection;
pub mod error;
pub mod payload;
pub mod pending;
pub mod registry;
pub mod transport;

pub use cache::{ConnectOptions, OptionsSource, QueryClient, QueryClientBuilder, Snapshot};
pub use connection::{ConnectionEvents, ConnectionStatus, RecoverableConnection};
pub use error::ClientError;
pub use payload::Payload;
pub use pending::{LoadError, LoadResolver, PendingLoad};
pub use registry::{Listener, SubscriberRegistry, Subscription};
pub use transport::{
    ClientFrame, Connector, Socket, SocketEvent, SocketPeer, WsConnector, CLOSE_ABNORMAL,
    CLOSE_NO_STATUS, CLOSE_NORMAL,
};
