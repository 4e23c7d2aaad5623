//! Error types shared across the crate.
//!
//! Cancellation never shows up here: a cancelled run simply produces no
//! result, so none of these enums has a `Cancelled` variant.

use std::time::Duration;

/// Failure of a unit of work run by a [`CancellableEffect`](crate::effect::CancellableEffect).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EffectError<E> {
    /// The unit of work itself failed. The inner error is passed through untouched.
    #[error("effect failed: {0}")]
    Failed(E),
    /// The configured timeout elapsed before the unit of work settled.
    #[error("effect timed out after {0:?}")]
    Timeout(Duration),
}

impl<E> EffectError<E> {
    /// Returns `true` if this is a timeout rather than a failure of the work itself.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EffectError::Timeout(_))
    }

    /// The underlying unit-of-work error, if any.
    pub fn inner(&self) -> Option<&E> {
        match self {
            EffectError::Failed(e) => Some(e),
            EffectError::Timeout(_) => None,
        }
    }
}

/// Failure reported by a [`StateStorage`](crate::middleware::StateStorage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to serialize persisted state")]
    Serialize(#[from] serde_json::Error),
}

/// Failure while hydrating or writing persisted state.
///
/// These are logged and never surface as a panic; hydration falls back to the
/// state already in the store.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("persisted payload could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("stored version {stored} does not match {current} and no migration is configured")]
    VersionMismatch { stored: u32, current: u32 },
    #[error("migration from version {from} failed: {reason}")]
    Migration { from: u32, reason: String },
}

/// Failure talking to a devtools connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DevtoolsError {
    #[error("devtools connection is not available")]
    Disconnected,
    #[error("failed to send to devtools: {0}")]
    Send(String),
    #[error("malformed devtools payload: {0}")]
    Malformed(String),
}

/// Rejected scheduler operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("an effect with id `{0}` is already queued or running")]
    DuplicateId(String),
}
