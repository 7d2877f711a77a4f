use std::net::ToSocketAddrs;

use mokulink_transport::{AddressResolver, TcpConnector};
use tracing::info;

use crate::config::LinkConfig;
use crate::error::Result;
use crate::link::DeviceLink;

/// Connect to a device with default configuration.
pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<DeviceLink> {
    connect_with_config(addr, LinkConfig::default())
}

/// Connect with explicit configuration.
pub fn connect_with_config(
    addr: impl ToSocketAddrs + std::fmt::Debug,
    config: LinkConfig,
) -> Result<DeviceLink> {
    let stream = TcpConnector::new()
        .with_connect_timeout(config.connect_timeout)
        .with_nodelay(config.nodelay)
        .connect(addr)?;
    let link = DeviceLink::from_stream(stream, config)?;
    info!(peer = ?link.peer_addr(), "device link ready");
    Ok(link)
}

/// Resolve a device name or serial, then connect.
pub fn connect_by_name(
    resolver: &dyn AddressResolver,
    name: &str,
    config: LinkConfig,
) -> Result<DeviceLink> {
    let addr = resolver.resolve(name)?;
    connect_with_config(addr, config)
}
