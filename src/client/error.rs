use thiserror::Error;

use crate::client::pending::LoadError;
use crate::routing::PatternError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// `read` or `subscribe` before `load` for this path.
    #[error("query {path} was read before it was loaded")]
    NotLoaded { path: String },

    /// The cached value for this path is an error payload.
    #[error("query {path} failed: {detail}")]
    Payload { path: String, detail: String },

    #[error("loading {path} failed: {source}")]
    Load { path: String, source: LoadError },

    #[error("invalid route: {0}")]
    Route(#[from] PatternError),
}
