use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::tcp::TcpConnector;

/// Turns a device name, serial or address literal into a socket address.
///
/// Network discovery lives outside this crate; implementations only answer
/// from what they already know.
pub trait AddressResolver {
    fn resolve(&self, target: &str) -> Result<SocketAddr>;
}

/// Resolver backed by a fixed name table.
///
/// Address literals (`10.0.1.17`, `10.0.1.17:27184`) always resolve, with the
/// default port filled in when missing. Names and serials are matched
/// case-insensitively.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, SocketAddr>,
    default_port: u16,
}

impl StaticResolver {
    /// Create an empty resolver using the standard device port.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            default_port: TcpConnector::DEFAULT_PORT,
        }
    }

    /// Override the port used for bare IP literals.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Add a name (or serial) entry.
    pub fn with_entry(mut self, name: &str, addr: SocketAddr) -> Self {
        self.insert(name, addr);
        self
    }

    /// Add or replace a name (or serial) entry.
    pub fn insert(&mut self, name: &str, addr: SocketAddr) {
        self.entries.insert(name.to_ascii_lowercase(), addr);
    }

    /// Number of named entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no named entries are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, target: &str) -> Result<SocketAddr> {
        let target = target.trim();
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(addr);
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.default_port));
        }

        match self.entries.get(&target.to_ascii_lowercase()) {
            Some(addr) => {
                debug!(target, %addr, "resolved device name");
                Ok(*addr)
            }
            None => Err(TransportError::NotFound(target.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_ip_literal_with_default_port() {
        let resolver = StaticResolver::new();
        let addr = resolver.resolve("10.0.1.17").unwrap();
        assert_eq!(addr, "10.0.1.17:27184".parse().unwrap());
    }

    #[test]
    fn resolves_full_socket_literal() {
        let resolver = StaticResolver::new().with_default_port(1);
        let addr = resolver.resolve("10.0.1.17:9000").unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn resolves_names_case_insensitively() {
        let addr: SocketAddr = "192.168.1.5:27184".parse().unwrap();
        let resolver = StaticResolver::new()
            .with_entry("LabScope", addr)
            .with_entry("000123", addr);
        assert_eq!(resolver.resolve("labscope").unwrap(), addr);
        assert_eq!(resolver.resolve(" 000123 ").unwrap(), addr);
        assert_eq!(resolver.len(), 2);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let resolver = StaticResolver::new();
        let err = resolver.resolve("bench-2").unwrap_err();
        assert!(matches!(err, TransportError::NotFound(name) if name == "bench-2"));
    }
}
