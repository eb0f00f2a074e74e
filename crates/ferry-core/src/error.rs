//! Error types for the transfer engines

use thiserror::Error;

/// Errors surfaced by the sender and receiver engines.
///
/// The engines never swallow errors; they classify and return. Retry
/// policy belongs to the front-end: [`TransferError::is_retryable`]
/// tells it whether a fresh stream and a new resume exchange may
/// succeed.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Unexpected message kind, malformed payload, oversized frame,
    /// or a rejected handshake. Never retryable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Whole-file checksum mismatch after streaming. Never retryable.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// A manifest path that would escape the destination root.
    /// Detected before any disk write. Never retryable.
    #[error("unsafe path in manifest: {0}")]
    Path(String),

    /// The remote side sent an `Error` message; carries its payload.
    #[error("remote error: {0}")]
    Remote(String),

    /// The confirmation hook declined the transfer.
    #[error("transfer rejected by user")]
    Aborted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether reconnecting and re-exchanging `Resume` may succeed.
    ///
    /// Only I/O errors are ever retryable; the classifier is a
    /// case-insensitive substring match on the error text, so OS and
    /// transport error strings are matched without enumerating error
    /// kinds per platform.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Io(err) => is_retryable_io_message(&err.to_string()),
            _ => false,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }
}

/// Substring patterns marking an I/O failure as worth a reconnect.
const RETRYABLE_PATTERNS: &[&str] = &[
    "stream reset",
    "connection reset",
    "broken pipe",
    "use of closed network connection",
    "i/o timeout",
    "temporary failure",
    "connection refused",
    "no route to host",
    "network is unreachable",
];

/// Case-insensitive substring classification of an I/O error message.
pub fn is_retryable_io_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_classifier_matches_known_patterns() {
        assert!(is_retryable_io_message("Connection reset by peer (os error 104)"));
        assert!(is_retryable_io_message("Broken pipe (os error 32)"));
        assert!(is_retryable_io_message("i/o timeout"));
        assert!(is_retryable_io_message("STREAM RESET by remote"));
        assert!(!is_retryable_io_message("permission denied"));
        assert!(!is_retryable_io_message("no space left on device"));
    }

    #[test]
    fn test_only_io_errors_are_retryable() {
        let io_err = TransferError::Io(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"));
        assert!(io_err.is_retryable());

        assert!(!TransferError::protocol("bad kind").is_retryable());
        assert!(!TransferError::Aborted.is_retryable());
        assert!(!TransferError::Path("../evil".into()).is_retryable());
        assert!(!TransferError::Remote("i/o timeout".into()).is_retryable());
    }
}
