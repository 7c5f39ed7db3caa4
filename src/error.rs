//! Core error types and result handling.
//!
//! The taxonomy mirrors the transaction engine's failure modes: configuration
//! errors fail immediately and are never retried, I/O errors feed the retry
//! loop, slave exceptions and correlation mismatches are final for a call.

use thiserror::Error;

use crate::msg::ExceptionCode;

/// Result type used throughout the crate.
pub type ModlinkResult<T> = Result<T, ModlinkError>;

/// Errors surfaced by the transaction engine and framing layers.
#[derive(Debug, Error)]
pub enum ModlinkError {
    /// Missing request or connection. Fails immediately, no I/O is attempted.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connect/write/read failure, truncated frame, checksum mismatch or an
    /// exhausted retry budget.
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer closed the stream cleanly. Kept apart from [`ModlinkError::Io`]
    /// so the server loop can treat it as normal termination.
    #[error("connection closed by peer")]
    Eof,

    /// The slave answered with a protocol-level exception response. A valid,
    /// correlated reply; never retried.
    #[error("slave exception: {0}")]
    Slave(ExceptionCode),

    /// Transaction identifier mismatch with validity checking enabled.
    #[error("transaction ID mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: u16, actual: u16 },
}

impl ModlinkError {
    /// Convenience constructor for I/O errors.
    pub fn io<S: Into<String>>(message: S) -> Self {
        ModlinkError::Io(message.into())
    }

    /// True for the clean end-of-stream case.
    pub fn is_eof(&self) -> bool {
        matches!(self, ModlinkError::Eof)
    }
}

impl From<std::io::Error> for ModlinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ModlinkError::Eof,
            _ => ModlinkError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_is_distinguished_from_io() {
        let eof: ModlinkError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(eof.is_eof());

        let refused: ModlinkError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(!refused.is_eof());
        assert!(matches!(refused, ModlinkError::Io(_)));
    }

    #[test]
    fn test_mismatch_message() {
        let err = ModlinkError::Mismatch {
            expected: 5,
            actual: 6,
        };
        assert_eq!(err.to_string(), "transaction ID mismatch: expected 5, got 6");
    }
}
