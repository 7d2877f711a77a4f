use std::time::Duration;

use mokulink_wire::DEFAULT_MAX_PAYLOAD;

/// Configuration for a [`DeviceLink`](crate::DeviceLink).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Protocol name announced in the deploy handshake.
    pub protocol_name: String,
    /// Local protocol version (`<major>.<minor>`).
    pub protocol_version: String,
    /// Name reported to the device as the controlling host.
    pub client_name: Option<String>,
    /// Time allowed for the TCP connect.
    pub connect_timeout: Duration,
    /// Time allowed for an ordinary request/reply exchange.
    pub request_timeout: Duration,
    /// Time allowed for a deploy, which reloads the instrument on the device.
    pub deploy_timeout: Duration,
    /// Maximum packet payload accepted from the device.
    pub max_payload_size: usize,
    /// Frame payloads that arrive while waiting for a reply are kept, up to this many.
    pub max_pending_frames: usize,
    /// Disable Nagle's algorithm on the connection.
    pub nodelay: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol_name: "mokulink".to_string(),
            protocol_version: "1.0".to_string(),
            client_name: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            deploy_timeout: Duration::from_secs(20),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_pending_frames: 8,
            nodelay: true,
        }
    }
}
