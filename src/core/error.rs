//! Classified transfer errors.
//!
//! Every failure crossing a component seam is mapped to one of these
//! kinds so callers can decide between retrying, switching source, or
//! failing the task.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Tracker or peer unreachable, or the socket timed out.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// TLS handshake or certificate validation failed.
    #[error("trust: {0}")]
    Trust(String),

    /// Chunk checksum mismatch.
    #[error("integrity: chunk {index} failed verification")]
    Integrity { index: u32 },

    /// Destination unwritable, source missing, disk full.
    #[error("resource: {0}")]
    Resource(String),

    /// Serving peer is at its concurrency cap.
    #[error("peer busy")]
    Busy,

    /// Malformed frame or unexpected response.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the condition may clear on its own and the operation is
    /// worth repeating, possibly against a different source.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Connectivity(_)
                | TransferError::Integrity { .. }
                | TransferError::Busy
                | TransferError::Protocol(_)
                | TransferError::NotFound(_)
        )
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        // tokio-rustls reports handshake and alert failures as io errors
        // wrapping the rustls error.
        if e.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
            return TransferError::Trust(e.to_string());
        }
        match e.kind() {
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe | TimedOut | UnexpectedEof | AddrNotAvailable => {
                TransferError::Connectivity(e.to_string())
            }
            InvalidData => TransferError::Protocol(e.to_string()),
            _ => TransferError::Resource(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let e: TransferError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(e, TransferError::Connectivity(_)));

        let e: TransferError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(e, TransferError::Resource(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_trust_not_retryable() {
        assert!(!TransferError::Trust("bad cert".into()).is_retryable());
        assert!(TransferError::Busy.is_retryable());
        assert!(TransferError::Integrity { index: 2 }.is_retryable());
    }
}
