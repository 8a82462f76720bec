//! Error types for the relay core.
//!
//! All fallible operations in the relay return [`RelayError`]. Errors are
//! categorized as transient (the operation may succeed if retried, the
//! process continues) or permanent (the input or state is wrong and retrying
//! cannot help). Nothing in the core panics on bad data; unexpected
//! inconsistencies are logged and degrade gracefully.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias used across the relay crates.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error classification used by retry and logging decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// May succeed on retry (network, store reads).
    Transient,
    /// Will not succeed on retry (bad input, precondition violations).
    Permanent,
}

/// Errors produced by the relay core subsystems.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The feature store could not serve a read.
    #[error("feature store read failed: {message}")]
    StoreRead { message: String },

    /// The feature store has not received its initial data yet.
    #[error("feature store is not initialized")]
    StoreNotInitialized,

    /// An incoming event body could not be parsed at all.
    #[error("invalid event data: {message}")]
    InvalidEventData { message: String },

    /// An incoming event carried neither a user nor a context.
    #[error("event has no user or context")]
    NoUserOrContext,

    /// A credential of the wrong kind was presented to an endpoint.
    #[error("credential kind mismatch for this endpoint")]
    CredentialKindMismatch,

    /// An operation was attempted against state that was never established,
    /// e.g. updating an environment that was never added.
    #[error("precondition violation: {message}")]
    PreconditionViolation { message: String },

    /// An upstream POST failed with a retryable status or transport error.
    #[error("event delivery failed: {message} (retryable: {retryable})")]
    EventDelivery { message: String, retryable: bool },

    /// A credential was rejected: a presented credential matches no known
    /// environment, or the upstream events endpoint returned 401. For an
    /// event queue this is fatal; sends stop until the credential rotates.
    #[error("credential was not accepted (401)")]
    Unauthorized,

    /// JSON encoding of an outgoing payload failed.
    #[error("serialization failed: {message}")]
    Serialization { message: String },

    /// The component has been closed; the in-flight operation was rejected
    /// so the caller can tell a shutdown race from success.
    #[error("component is shut down")]
    Shutdown,
}

impl RelayError {
    /// Classify the error for retry and logging decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::StoreRead { .. } | RelayError::StoreNotInitialized => {
                ErrorCategory::Transient
            }
            RelayError::EventDelivery { retryable, .. } => {
                if *retryable {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Permanent
                }
            }
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn store_read(err: impl std::fmt::Display) -> Self {
        RelayError::StoreRead {
            message: err.to_string(),
        }
    }

    pub fn invalid_event(err: impl std::fmt::Display) -> Self {
        RelayError::InvalidEventData {
            message: err.to_string(),
        }
    }

    pub fn precondition(err: impl std::fmt::Display) -> Self {
        RelayError::PreconditionViolation {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization {
            message: err.to_string(),
        }
    }
}
