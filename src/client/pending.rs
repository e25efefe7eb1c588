//! One-shot load handles.
//!
//! A [`PendingLoad`] is the awaitable side of one load cycle: it settles
//! once, when the first value arrives or the load fails. Clones share the
//! same outcome, so any number of readers can wait on the same cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a load cycle failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed with code {0}")]
    Closed(u16),

    #[error("load cycle ended before a value arrived")]
    Abandoned,
}

type Outcome = Result<(), LoadError>;

/// Awaitable handle for one load cycle.
#[derive(Clone)]
pub struct PendingLoad {
    future: Shared<BoxFuture<'static, Outcome>>,
    outcome: Arc<OnceLock<Outcome>>,
}

impl PendingLoad {
    /// Create a handle and the resolver that settles it.
    pub fn new() -> (PendingLoad, LoadResolver) {
        let (tx, rx) = oneshot::channel::<Outcome>();
        let outcome = Arc::new(OnceLock::new());
        let future = async move { rx.await.unwrap_or(Err(LoadError::Abandoned)) }
            .boxed()
            .shared();
        (
            PendingLoad {
                future,
                outcome: Arc::clone(&outcome),
            },
            LoadResolver {
                tx: Mutex::new(Some(tx)),
                outcome,
            },
        )
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// The outcome, if the cycle has settled.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.get().cloned()
    }

    /// The failure, if the cycle settled with one.
    pub fn error(&self) -> Option<LoadError> {
        match self.outcome.get() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

impl Future for PendingLoad {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx)
    }
}

impl std::fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLoad")
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

/// Settles a [`PendingLoad`]. Only the first call has an effect.
#[derive(Debug)]
pub struct LoadResolver {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
    outcome: Arc<OnceLock<Outcome>>,
}

impl LoadResolver {
    /// Mark the cycle loaded. Returns false if it had already settled.
    pub fn resolve(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Fail the cycle. Returns false if it had already settled.
    pub fn reject(&self, err: LoadError) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(tx) = tx else {
            return false;
        };
        let _ = self.outcome.set(outcome.clone());
        let _ = tx.send(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settles_once() {
        let (pending, resolver) = PendingLoad::new();
        assert!(!pending.is_settled());

        assert!(resolver.resolve());
        assert!(!resolver.reject(LoadError::Closed(1000)));

        assert!(pending.is_settled());
        assert_eq!(pending.clone().await, Ok(()));
        assert_eq!(pending.outcome(), Some(Ok(())));
        assert!(pending.error().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_the_rejection() {
        let (pending, resolver) = PendingLoad::new();
        let waiters: Vec<_> = (0..3).map(|_| tokio::spawn(pending.clone())).collect();

        resolver.reject(LoadError::Connection("refused".into()));
        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap(),
                Err(LoadError::Connection("refused".into()))
            );
        }
        assert_eq!(pending.error(), Some(LoadError::Connection("refused".into())));
    }

    #[tokio::test]
    async fn test_dropped_resolver_abandons() {
        let (pending, resolver) = PendingLoad::new();
        drop(resolver);
        assert_eq!(pending.await, Err(LoadError::Abandoned));
    }
}
