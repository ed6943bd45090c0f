//! Error types for keystone storage operations
//!
//! Every failure crossing the storage-handler seam is a [`StorageError`].
//! Variants carry enough context (file, byte range, checksums) to diagnose
//! the failure without re-running the operation.

use std::path::PathBuf;

use thiserror::Error;

use crate::ids::SessionId;

/// Keystone error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A file that had to exist was not found
    #[error("File not found: {}", .path.display())]
    NotFound {
        /// The missing file
        path: PathBuf,
    },

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", location(.path, " in "))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The database does not accept writes right now
    #[error("Writing is not allowed: {reason}")]
    ReadOnly {
        /// Why writes are refused (read-only open, suspended state)
        reason: String,
    },

    /// No disk space could be reclaimed
    #[error("Disk full{}: could not free {requested_bytes} bytes", location(.path, " in "))]
    DiskFull {
        /// File being written when space ran out, if known
        path: Option<PathBuf>,
        /// Bytes the caller needed
        requested_bytes: u64,
    },

    /// Checksum verification failed and no recovery policy suppressed it
    #[error("Checksum mismatch in {} for bytes {start}..{end}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    Corruption {
        /// File where checksum failed
        path: PathBuf,
        /// Start of the verified byte range
        start: u64,
        /// End (exclusive) of the verified byte range
        end: u64,
        /// Checksum stored alongside the data
        expected: u32,
        /// Checksum computed over the data
        actual: u32,
    },

    /// The power-failure countdown reached zero
    #[error("Simulated power loss{}", location(.path, " while writing "))]
    SimulatedPowerLoss {
        /// File being written when the fault fired, if known
        path: Option<PathBuf>,
    },

    /// Connection refused because another session holds exclusive mode
    #[error("Database is in exclusive mode (held by session {holder})")]
    ExclusiveModeActive {
        /// The session holding the exclusive lock
        holder: SessionId,
    },

    /// The session's connection was closed while it waited
    #[error("Connection closed for session {session}")]
    ConnectionClosed {
        /// The session whose wait was cancelled
        session: SessionId,
    },

    /// A block started but did not complete (crash point)
    #[error("Torn block in {} at offset {offset}: expected {expected_len} bytes, only {available} available", .path.display())]
    TornBlock {
        /// File with the torn block
        path: PathBuf,
        /// Offset where the torn block begins
        offset: u64,
        /// Length announced by the block header
        expected_len: u64,
        /// Bytes actually present
        available: u64,
    },

    /// Block payload exceeds the configured maximum
    #[error("Block too large: {len} bytes exceeds limit of {max} bytes")]
    OversizedBlock {
        /// Size of the rejected payload
        len: u64,
        /// Maximum allowed payload
        max: u64,
    },

    /// Unknown option name or unparsable option value
    #[error("Invalid setting {name} = {value}")]
    InvalidSetting {
        /// Option name as given
        name: String,
        /// Option value as given
        value: String,
    },

    /// Every ObjectId in a namespace has been handed out
    #[error("ObjectId namespace exhausted ({namespace})")]
    IdSpaceExhausted {
        /// Which namespace ran out
        namespace: &'static str,
    },

    /// The database has been closed
    #[error("Database is closed")]
    DatabaseClosed,

    /// Byte range does not lie inside the buffer
    #[error("Invalid range {start}..{end} for {len} bytes")]
    InvalidRange {
        /// Range start
        start: usize,
        /// Range end, exclusive
        end: usize,
        /// Buffer length
        len: usize,
    },
}

impl StorageError {
    /// Wrap an I/O error with the file it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        StorageError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for faults injected by the power-failure simulator.
    pub fn is_simulated_power_loss(&self) -> bool {
        matches!(self, StorageError::SimulatedPowerLoss { .. })
    }
}

fn location(path: &Option<PathBuf>, prefix: &str) -> String {
    match path {
        Some(path) => format!("{}{}", prefix, path.display()),
        None => String::new(),
    }
}

/// Convert std::io::Error to StorageError::Io
impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for keystone operations
pub type StoreResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_display() {
        let err = StorageError::Corruption {
            path: PathBuf::from("/tmp/test.data"),
            start: 64,
            end: 128,
            expected: 0x12345678,
            actual: 0x87654321,
        };

        let display = format!("{}", err);
        assert!(display.contains("Checksum mismatch"));
        assert!(display.contains("64..128"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io_err.into();

        match err {
            StorageError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::PermissionDenied);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_exclusive_rejection_is_distinct() {
        let err = StorageError::ExclusiveModeActive {
            holder: SessionId(7),
        };
        assert!(format!("{}", err).contains("exclusive mode"));
        assert!(!err.is_simulated_power_loss());
    }
}
