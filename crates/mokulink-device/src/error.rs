use mokulink_transport::TransportError;
use mokulink_wire::PacketError;

/// Errors that can occur on the device link.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Packet-level error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// The deploy handshake could not be completed.
    #[error("deploy handshake failed: {0}")]
    DeployFailed(String),

    /// The device refused a request with a status code.
    #[error("device rejected {operation} (code {code})")]
    Rejected { operation: &'static str, code: u8 },

    /// The device reported an error on the ERROR channel.
    #[error("device error {code}: {message}")]
    Device { code: u8, message: String },

    /// The device closed the connection.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// The host tried to send something the protocol cannot express.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A reply did not match the request it answers.
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<DeviceError> for TransportError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Transport(inner) => inner,
            DeviceError::Packet(PacketError::Io(io)) => TransportError::Io(io),
            DeviceError::Packet(PacketError::ConnectionClosed) | DeviceError::Disconnected(_) => {
                TransportError::Closed
            }
            DeviceError::Rejected { operation, code } => {
                TransportError::Rejected { operation, code }
            }
            DeviceError::Timeout(timeout) => TransportError::Timeout(timeout),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
