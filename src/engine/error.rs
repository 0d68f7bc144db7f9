use ulid::Ulid;

use crate::model::Actor;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The span is already taken by the given occupant.
    #[error("conflict with {0}")]
    Conflict(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    /// The hold lapsed before it could be used.
    #[error("hold expired: {0}")]
    Expired(Ulid),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("{id} is {status}")]
    InvalidState { id: Ulid, status: &'static str },
    #[error("forbidden for {0}")]
    Forbidden(Actor),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Only infrastructure failures are worth retrying; everything else is a
    /// domain outcome that will repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }
}
