use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::DeviceStream;

/// TCP connector for device links.
///
/// Instruments listen on a single well-known port; every logical channel is
/// multiplexed over the one connection by the wire layer.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpConnector {
    /// Port the instrument control service listens on.
    pub const DEFAULT_PORT: u16 = 27184;
    /// Default time allowed for the TCP handshake.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a connector with default settings.
    pub fn new() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable Nagle's algorithm on new streams.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Connect to a device (blocking).
    ///
    /// Every resolved address is tried in order; the last failure is returned.
    pub fn connect(&self, addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<DeviceStream> {
        let label = format!("{addr:?}");
        let addrs = addr.to_socket_addrs().map_err(|e| TransportError::Connect {
            addr: label.clone(),
            source: e,
        })?;

        let mut last_err = None;
        for candidate in addrs {
            match self.connect_addr(candidate) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| TransportError::Connect {
            addr: label,
            source: std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ),
        }))
    }

    /// Connect to one concrete socket address.
    pub fn connect_addr(&self, addr: SocketAddr) -> Result<DeviceStream> {
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            }
        })?;
        stream.set_nodelay(self.nodelay)?;
        info!(%addr, "connected to device");
        debug!(nodelay = self.nodelay, "tcp options applied");
        Ok(DeviceStream::from_tcp(stream))
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}
