//! Hub-wide error taxonomy
//!
//! Crate-level errors convert into one of these categories when they cross a
//! component boundary. None of them is fatal to the hub: configuration
//! errors disable one integration, transient I/O is retried on the next
//! cycle, listener errors are contained per callback, and invariant
//! violations skip one rule evaluation.

use thiserror::Error;

/// Result alias for hub operations
pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// Required setup data is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A scanner or network call failed; try again next cycle
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A subscriber, scheduled job or action failed
    #[error("listener error: {0}")]
    Listener(String),

    /// A rule referenced something that does not exist
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl HubError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl From<crate::EntityIdError> for HubError {
    fn from(err: crate::EntityIdError) -> Self {
        Self::Configuration(err.to_string())
    }
}
