//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Client socket closes:
//!     → code 1006 (abnormal): reconnect.rs schedules one retry after a fixed delay
//!     → any other code: the load is marked stale and reloaded on next read
//! ```
//!
//! # Design Decisions
//! - One retry per abnormal closure; no exponential backoff, no attempt cap
//! - Retries are epoch-gated so a stale timer never opens a second socket

pub mod reconnect;

pub use reconnect::ReconnectPolicy;
