//! Error types for the page store and editing session.

use thiserror::Error;

/// Main error type for store and session operations.
///
/// A date that was never saved is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid date: {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Coarse classification of a [`PageError`], as shown to a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Disk or file-system failure, including an unreadable store.
    StorageIo,
    /// Malformed date key, record shape, or misuse of the session.
    Validation,
    /// A record could not be encoded or decoded.
    Serialization,
}

impl PageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PageError::Io(_)
            | PageError::Corruption(_)
            | PageError::InvalidFormat(_)
            | PageError::Locked
            | PageError::NotInitialized => ErrorKind::StorageIo,
            PageError::InvalidDate(_)
            | PageError::Validation(_)
            | PageError::InvalidOperation(_) => ErrorKind::Validation,
            PageError::Serialization(_) | PageError::Deserialization(_) => {
                ErrorKind::Serialization
            }
        }
    }
}

impl From<rmp_serde::encode::Error> for PageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PageError::Deserialization(e.to_string())
    }
}

/// Result type for page operations.
pub type Result<T> = std::result::Result<T, PageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let io = PageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::StorageIo);
        assert_eq!(PageError::InvalidDate("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(
            PageError::Deserialization("bad".into()).kind(),
            ErrorKind::Serialization
        );
        assert_eq!(PageError::Locked.kind(), ErrorKind::StorageIo);
    }

    #[test]
    fn test_invalid_date_message() {
        let err = PageError::InvalidDate("2024-13-01".into());
        assert_eq!(
            err.to_string(),
            "Invalid date: \"2024-13-01\" (expected YYYY-MM-DD)"
        );
    }
}
