//! Error types for the sync engine.

use tandem_model::{MapError, SystemKind};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A record could not be mapped between schemas. Per-record; never
    /// aborts the cycle.
    #[error("mapping failed: {0}")]
    Mapping(#[from] MapError),

    /// A recoverable external-system failure (network, 5xx, rate limit).
    #[error("transient failure from {system}: {message}")]
    TransientSystem {
        /// Which system failed.
        system: SystemKind,
        /// Error message.
        message: String,
    },

    /// A non-recoverable external-system failure (4xx other than 429, auth).
    #[error("permanent failure from {system}: {message}")]
    PermanentSystem {
        /// Which system failed.
        system: SystemKind,
        /// HTTP status code, when one applies.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// The sync queue's backing store failed; the current cycle aborts.
    #[error("sync queue unavailable: {message}")]
    QueueUnavailable {
        /// Failure detail.
        message: String,
    },

    /// The change cache's backing store failed; the current cycle aborts.
    #[error("change cache unavailable: {message}")]
    CacheUnavailable {
        /// Failure detail.
        message: String,
    },

    /// The engine is shutting down and refused new work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// An internal invariant was violated.
    #[error("invalid sync state: {0}")]
    State(String),
}

impl SyncError {
    /// Creates a transient system error.
    pub fn transient(system: SystemKind, message: impl Into<String>) -> Self {
        Self::TransientSystem {
            system,
            message: message.into(),
        }
    }

    /// Creates a permanent system error.
    pub fn permanent(system: SystemKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::PermanentSystem {
            system,
            status,
            message: message.into(),
        }
    }

    /// Classifies an HTTP status: 429 and 5xx are transient, other 4xx are
    /// permanent. The status code is kept in the message so dead-letter
    /// records and logs carry it.
    pub fn from_status(system: SystemKind, status: u16, message: impl Into<String>) -> Self {
        if status == 429 || (500..=599).contains(&status) {
            Self::TransientSystem {
                system,
                message: format!("status {status}: {}", message.into()),
            }
        } else {
            Self::PermanentSystem {
                system,
                status: Some(status),
                message: format!("status {status}: {}", message.into()),
            }
        }
    }

    /// Creates a queue infrastructure error.
    pub fn queue_unavailable(message: impl Into<String>) -> Self {
        Self::QueueUnavailable {
            message: message.into(),
        }
    }

    /// Creates a cache infrastructure error.
    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            message: message.into(),
        }
    }

    /// Returns true if retrying the failed operation can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientSystem { .. })
    }

    /// Returns true if the failure is in the engine's own infrastructure and
    /// the whole cycle must abort.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SyncError::QueueUnavailable { .. } | SyncError::CacheUnavailable { .. }
        )
    }
}
