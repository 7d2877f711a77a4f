use std::io::ErrorKind;
use std::time::Duration;

/// Errors that can occur in device transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device did not answer within the allotted time.
    #[error("device did not respond within {0:?}")]
    Timeout(Duration),

    /// The device answered with something the host cannot interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The device understood the request but refused it.
    #[error("device rejected {operation} (code {code})")]
    Rejected { operation: &'static str, code: u8 },

    /// A device name or serial could not be resolved to an address.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// True when the link is gone and no further request can succeed.
    pub fn is_terminal(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
