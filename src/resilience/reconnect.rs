//! Fixed-delay reconnection policy.

use std::time::Duration;

use crate::client::transport::CLOSE_ABNORMAL;

/// Default delay before retrying an abnormally closed socket.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Decides whether and when a closed socket is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Only an abnormal closure is retried; every other code is final.
    pub fn should_retry(&self, code: u16) -> bool {
        code == CLOSE_ABNORMAL
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}
