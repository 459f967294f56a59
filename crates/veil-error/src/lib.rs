#![forbid(unsafe_code)]
//! Error types for VeilFS.
//!
//! Defines `VeilError` and a `Result<T>` alias used throughout the
//! workspace. Authentication failures deliberately do not distinguish a
//! wrong password from a corrupted header.

use thiserror::Error;
use veil_types::ParseError;

/// Unified error type for all VeilFS operations.
#[derive(Debug, Error)]
pub enum VeilError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid password or corrupted header")]
    Auth,

    #[error("corrupt volume: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no free clusters left on volume")]
    DiskFull,

    #[error("I/O out of bounds: offset={offset} len={len} device_len={device_len}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        device_len: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("destination closed before stream completed")]
    BrokenPipe,
}

impl From<ParseError> for VeilError {
    fn from(err: ParseError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Result alias using `VeilError`.
pub type Result<T> = std::result::Result<T, VeilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_surface_as_corruption() {
        let parse = ParseError::InvalidField {
            field: "boot_signature",
            reason: "missing 0x55AA",
        };
        let err = VeilError::from(parse);
        assert!(matches!(err, VeilError::Corrupt(_)));
        assert!(err.to_string().contains("boot_signature"));
    }

    #[test]
    fn auth_error_does_not_leak_detail() {
        assert_eq!(
            VeilError::Auth.to_string(),
            "invalid password or corrupted header"
        );
    }
}
