//! Error types for key generation and registry maintenance
//!
//! Every per-key failure is isolated: the lifecycle manager reports it and moves
//! on to the next request unless the error is fatal for the whole batch.

use std::path::PathBuf;
use thiserror::Error;

pub type KeyResult<T> = std::result::Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    /// Malformed operator input: empty alias, reserved characters, zero validity
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The cryptographic toolkit refused or failed an operation
    #[error("Key generation failed during {operation}: {cause}")]
    Backend { operation: String, cause: String },

    /// CA certificate or key is missing, unreadable, invalid or mismatched
    #[error("CA error for {path:?}: {cause}")]
    Ca { path: PathBuf, cause: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file cannot be trusted any more; stops the batch
    #[error("Registry {path:?} is corrupt: {cause}")]
    RegistryCorrupt { path: PathBuf, cause: String },
}

impl KeyError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        KeyError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend(operation: &str, cause: impl ToString) -> Self {
        KeyError::Backend {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn ca(path: impl Into<PathBuf>, cause: impl ToString) -> Self {
        KeyError::Ca {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeyError::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors abort a batch even under the continue-on-error policy
    pub fn is_fatal(&self) -> bool {
        matches!(self, KeyError::RegistryCorrupt { .. })
    }
}

impl From<openssl::error::ErrorStack> for KeyError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        KeyError::backend("openssl", e)
    }
}
