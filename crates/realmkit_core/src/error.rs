//! Error types for realmkit core.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Why a realm file could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessKind {
    /// The process lacks read or write permission for the path.
    PermissionDenied,
    /// The file already exists where a new one had to be created.
    Exists,
    /// Any other failure to open or read the file, including a wrong
    /// encryption key.
    AccessError,
    /// Another process holds the file with an engine it cannot share with.
    IncompatibleLockFile,
}

impl fmt::Display for FileAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PermissionDenied => "permission denied",
            Self::Exists => "file exists",
            Self::AccessError => "access error",
            Self::IncompatibleLockFile => "incompatible lock file",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in realmkit core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A realm at the same path is already open with incompatible options.
    #[error("incompatible open options: {message}")]
    ConfigMismatch {
        /// Which option disagreed.
        message: String,
    },

    /// The realm file could not be opened.
    #[error("unable to open realm at '{}' ({kind}): {message}", path.display())]
    FileAccess {
        /// Classification of the failure.
        kind: FileAccessKind,
        /// The path that was being opened.
        path: PathBuf,
        /// Detail from the operating system or engine.
        message: String,
    },

    /// A read-only open supplied a schema but the file was never initialized.
    #[error("can't open an un-initialized realm at '{}' without a schema version", path.display())]
    UninitializedFile {
        /// Path of the uninitialized file.
        path: PathBuf,
    },

    /// A transaction call was made out of order or on a read-only realm.
    #[error("invalid transaction state: {message}")]
    InvalidTransactionState {
        /// What was attempted.
        message: String,
    },

    /// A realm handle was used from a thread other than the one that opened it.
    #[error("realm accessed from incorrect thread")]
    WrongThread,

    /// The target schema is malformed.
    #[error("schema validation failed: {}", errors.join("; "))]
    SchemaValidationFailed {
        /// One entry per violated rule.
        errors: Vec<String>,
    },

    /// The on-disk schema differs from the target and no migration may run.
    #[error("schema mismatch: {}", errors.join("; "))]
    SchemaMismatch {
        /// One entry per differing property or object type.
        errors: Vec<String>,
    },

    /// Schema reconciliation or the user migration callback failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The commit log is unreadable.
    #[error("realm file corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A table, column or row was not found in the group.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// Backend error.
    #[error("storage error: {0}")]
    Storage(#[from] realmkit_storage::StorageError),

    /// I/O error outside the backend (lock and notification files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// A key of the wrong length was supplied.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },
}

impl CoreError {
    /// Creates a config mismatch error.
    pub fn config_mismatch(message: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            message: message.into(),
        }
    }

    /// Creates a file access error.
    pub fn file_access(
        kind: FileAccessKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::FileAccess {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid transaction state error.
    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        Self::InvalidTransactionState {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failed error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Classifies an I/O failure raised while opening `path`.
    pub fn from_open_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => FileAccessKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => FileAccessKind::Exists,
            _ => FileAccessKind::AccessError,
        };
        Self::file_access(kind, path, err.to_string())
    }

    /// Returns the file access classification, if this is a file access error.
    #[must_use]
    pub fn file_access_kind(&self) -> Option<FileAccessKind> {
        match self {
            Self::FileAccess { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true for [`CoreError::ConfigMismatch`].
    #[must_use]
    pub fn is_config_mismatch(&self) -> bool {
        matches!(self, Self::ConfigMismatch { .. })
    }

    /// Returns true for [`CoreError::InvalidTransactionState`].
    #[must_use]
    pub fn is_invalid_transaction(&self) -> bool {
        matches!(self, Self::InvalidTransactionState { .. })
    }

    /// Returns true for [`CoreError::WrongThread`].
    #[must_use]
    pub fn is_wrong_thread(&self) -> bool {
        matches!(self, Self::WrongThread)
    }
}
