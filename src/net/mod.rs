//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming websocket upgrade
//!     → connection.rs (admission against max_connections, connection ID)
//!     → Hand off to the server dispatcher
//!     → Guard dropped when the socket ends (slot released)
//! ```
//!
//! # Design Decisions
//! - Bounded admission prevents resource exhaustion
//! - Each connection tracked for graceful shutdown

pub mod connection;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
