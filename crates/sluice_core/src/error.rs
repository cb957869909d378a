//! Error types for journal operations.

use sluice_blockdev::DeviceError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// A handle asked for more credits than one transaction may hold.
    #[error("handle requested {requested} credits, transactions hold at most {max}")]
    TooManyCredits {
        /// Credits requested.
        requested: u32,
        /// Configured maximum.
        max: u32,
    },

    /// The journal has latched an unrecoverable failure.
    #[error("journal aborted")]
    Aborted,

    /// A block copy could not be allocated, even after backing off.
    #[error("out of memory allocating a {len}-byte block copy")]
    OutOfMemory {
        /// Size of the failed allocation.
        len: usize,
    },

    /// The block I/O layer failed.
    ///
    /// Shared so the same failure can be both latched as the abort cause
    /// and returned to the caller.
    #[error("block I/O failed: {0}")]
    IoFailure(#[source] Arc<DeviceError>),

    /// The transaction cannot grow; the caller must restart the handle.
    #[error("transaction cannot be extended, restart the handle")]
    NeedsRestart,

    /// A handle modified more blocks than it reserved credits for.
    #[error("handle has no credits left")]
    CreditsExhausted,

    /// The call violates the journal's usage contract.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The configuration was rejected.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },
}

/// Coarse classification of a [`JournalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`JournalError::TooManyCredits`].
    TooManyCredits,
    /// See [`JournalError::Aborted`].
    Aborted,
    /// See [`JournalError::OutOfMemory`].
    OutOfMemory,
    /// See [`JournalError::IoFailure`].
    IoFailure,
    /// See [`JournalError::NeedsRestart`].
    NeedsRestart,
    /// See [`JournalError::CreditsExhausted`].
    CreditsExhausted,
    /// See [`JournalError::InvalidOperation`].
    InvalidOperation,
    /// See [`JournalError::InvalidConfig`].
    InvalidConfig,
}

impl From<DeviceError> for JournalError {
    fn from(err: DeviceError) -> Self {
        Self::IoFailure(Arc::new(err))
    }
}

impl JournalError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TooManyCredits { .. } => ErrorKind::TooManyCredits,
            Self::Aborted => ErrorKind::Aborted,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::IoFailure(_) => ErrorKind::IoFailure,
            Self::NeedsRestart => ErrorKind::NeedsRestart,
            Self::CreditsExhausted => ErrorKind::CreditsExhausted,
            Self::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
        }
    }

    /// Whether the journal can no longer accept updates after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Aborted | Self::IoFailure(_))
    }
}
