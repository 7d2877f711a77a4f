//! Deploy handshake.
//!
//! The host asks the device to load an instrument and the device answers once
//! the instrument is running. Both sides announce protocol name and version; a
//! reply from an incompatible peer is refused before its status is trusted.

use serde::{Deserialize, Serialize};

use crate::config::LinkConfig;
use crate::error::{DeviceError, Result};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_CLIENT_NAME_LEN: usize = 64;

/// Deploy request sent on the CONTROL channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployRequest {
    /// Protocol name.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
    /// Instrument to load.
    pub instrument_id: u8,
    /// Name of the controlling host, shown on the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// Deploy response sent by the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployResponse {
    /// Protocol name. Must match the request.
    pub protocol: String,
    /// Device protocol version.
    pub version: String,
    /// Instrument the device actually loaded.
    pub instrument_id: u8,
    /// Zero on success, otherwise the device's deploy error code.
    pub status: u8,
    /// Version of the loaded instrument bitstream.
    #[serde(default)]
    pub bitstream_version: u16,
}

/// Result of a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub instrument_id: u8,
    pub bitstream_version: u16,
    pub protocol_version: String,
}

impl DeployRequest {
    /// Build a request for `instrument_id` from link configuration.
    pub fn new(config: &LinkConfig, instrument_id: u8) -> Result<Self> {
        validate_protocol_name(&config.protocol_name)?;
        validate_version(&config.protocol_version)?;
        if let Some(name) = &config.client_name {
            if name.is_empty() || name.len() > MAX_CLIENT_NAME_LEN {
                return Err(DeviceError::DeployFailed(format!(
                    "invalid client name length: {}",
                    name.len()
                )));
            }
        }
        Ok(Self {
            protocol: config.protocol_name.clone(),
            version: config.protocol_version.clone(),
            instrument_id,
            client_name: config.client_name.clone(),
        })
    }

    /// Check the device's answer to this request.
    ///
    /// Protocol mismatches are handshake failures; a compatible device that
    /// refuses the instrument is reported as [`DeviceError::Rejected`].
    pub fn accept(&self, resp: DeployResponse) -> Result<DeployResult> {
        validate_protocol_name(&resp.protocol)?;
        validate_version(&resp.version)?;

        if resp.protocol != self.protocol {
            return Err(DeviceError::DeployFailed(format!(
                "unknown protocol '{}' (expected '{}')",
                resp.protocol, self.protocol
            )));
        }

        if !is_version_compatible(&self.version, &resp.version)? {
            return Err(DeviceError::DeployFailed(format!(
                "incompatible version '{}' (local '{}')",
                resp.version, self.version
            )));
        }

        if resp.status != 0 {
            return Err(DeviceError::Rejected {
                operation: "deploy",
                code: resp.status,
            });
        }

        if resp.instrument_id != self.instrument_id {
            return Err(DeviceError::DeployFailed(format!(
                "device loaded instrument {} (requested {})",
                resp.instrument_id, self.instrument_id
            )));
        }

        Ok(DeployResult {
            instrument_id: resp.instrument_id,
            bitstream_version: resp.bitstream_version,
            protocol_version: resp.version,
        })
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(DeviceError::DeployFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(DeviceError::DeployFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

/// Same major, and the device is at least as new as the host's minor.
fn is_version_compatible(local: &str, device: &str) -> Result<bool> {
    let (local_major, local_minor) = parse_version(local)?;
    let (device_major, device_minor) = parse_version(device)?;

    Ok(local_major == device_major && device_minor >= local_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |what: &str| DeviceError::DeployFailed(format!("invalid version '{version}': {what}"));

    let mut parts = version.split('.');
    let major = parts.next().ok_or_else(|| invalid("missing major"))?;
    let minor = parts.next().ok_or_else(|| invalid("missing minor"))?;
    if parts.next().is_some() {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major
        .parse::<u16>()
        .map_err(|_| invalid("non-numeric major"))?;
    let minor = minor
        .parse::<u16>()
        .map_err(|_| invalid("non-numeric minor"))?;

    Ok((major, minor))
}
