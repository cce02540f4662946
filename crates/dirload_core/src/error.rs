//! Error types for the bulk-load engine.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while importing or rebuilding.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Scratch storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] dirload_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Not enough memory for even the smallest buffer layout.
    #[error(
        "insufficient memory: {available} bytes available, at least {required} bytes required"
    )]
    InsufficientMemory {
        /// Memory that was available to the planner.
        available: u64,
        /// Minimum memory needed with a single worker thread.
        required: u64,
    },

    /// Configuration is inconsistent or incomplete.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the problem.
        message: String,
    },

    /// A distinguished name could not be parsed.
    #[error("invalid DN {dn:?}: {message}")]
    InvalidDn {
        /// The offending DN text.
        dn: String,
        /// Description of the problem.
        message: String,
    },

    /// LDIF input could not be parsed.
    #[error("LDIF error at line {line}: {message}")]
    Ldif {
        /// One-based line number of the record.
        line: u64,
        /// Description of the problem.
        message: String,
    },

    /// A scratch file did not decode as expected.
    #[error("scratch file corruption: {message}")]
    ScratchCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A structural invariant of the directory tree was violated.
    #[error("constraint violation: {message}")]
    ConstraintViolation {
        /// Description of the violation.
        message: String,
    },

    /// The destination store rejected an operation.
    #[error("store error: {message}")]
    Store {
        /// Description of the failure.
        message: String,
    },

    /// The run was canceled.
    ///
    /// This is a control signal, not a failure: the orchestrator reports a
    /// canceled run as interrupted.
    #[error("import canceled")]
    Canceled,

    /// A worker thread panicked.
    #[error("task {task} failed unexpectedly")]
    TaskFailed {
        /// Name of the task.
        task: String,
    },

    /// Another run already holds the scratch directory.
    #[error("scratch directory locked: {path}")]
    ScratchDirLocked {
        /// The locked directory.
        path: String,
    },
}

impl CoreError {
    /// Creates an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Creates an invalid DN error.
    pub fn invalid_dn(dn: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDn {
            dn: dn.into(),
            message: message.into(),
        }
    }

    /// Creates an LDIF parse error.
    pub fn ldif(line: u64, message: impl Into<String>) -> Self {
        Self::Ldif {
            line,
            message: message.into(),
        }
    }

    /// Creates a scratch corruption error.
    pub fn scratch_corruption(message: impl Into<String>) -> Self {
        Self::ScratchCorruption {
            message: message.into(),
        }
    }

    /// Creates a constraint violation error.
    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            message: message.into(),
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Returns true for the cancellation signal.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns true if the error reports a full disk.
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        let io = match self {
            Self::Io(err) => err,
            Self::Storage(dirload_storage::StorageError::Io(err)) => err,
            _ => return false,
        };
        io.raw_os_error() == Some(DISK_FULL_OS_ERROR)
    }
}

#[cfg(windows)]
const DISK_FULL_OS_ERROR: i32 = 112;
#[cfg(not(windows))]
const DISK_FULL_OS_ERROR: i32 = 28;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let err = CoreError::InsufficientMemory {
            available: 1024,
            required: 4096,
        };
        assert_eq!(
            err.to_string(),
            "insufficient memory: 1024 bytes available, at least 4096 bytes required"
        );
        assert_eq!(
            CoreError::constraint_violation("parent of 'cn=x' missing").to_string(),
            "constraint violation: parent of 'cn=x' missing"
        );
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = dirload_storage::StorageError::Discarded.into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert!(!err.is_canceled());
        assert!(CoreError::Canceled.is_canceled());
    }

    #[test]
    fn disk_full_is_recognised() {
        let full = CoreError::Io(io::Error::from_raw_os_error(DISK_FULL_OS_ERROR));
        assert!(full.is_disk_full());
        let wrapped: CoreError = dirload_storage::StorageError::Io(io::Error::from_raw_os_error(
            DISK_FULL_OS_ERROR,
        ))
        .into();
        assert!(wrapped.is_disk_full());
        assert!(!CoreError::store("x").is_disk_full());
    }
}
