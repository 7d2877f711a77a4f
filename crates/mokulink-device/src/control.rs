use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// CONTROL message type: deploy an instrument.
pub const CONTROL_DEPLOY: &str = "deploy";
/// CONTROL message type: read a property section.
pub const CONTROL_PROPERTIES: &str = "properties";
/// CONTROL message type: the host is going away.
pub const CONTROL_CLOSE: &str = "close";

/// CONTROL channel message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Reply to a [`CONTROL_PROPERTIES`] request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropertiesReply {
    /// Zero on success, otherwise the device's error code.
    pub status: u8,
    /// `(key, value)` pairs, keys fully qualified (`section.name`).
    #[serde(default)]
    pub entries: Vec<(String, String)>,
}

impl ControlMessage {
    /// Build a message of `msg_type` carrying `payload` as JSON.
    pub fn with_payload<T: Serialize>(msg_type: &str, payload: &T) -> Result<Self> {
        Ok(Self {
            msg_type: msg_type.to_string(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Create a property section request.
    pub fn properties(section: &str) -> Self {
        Self {
            msg_type: CONTROL_PROPERTIES.to_string(),
            payload: Some(serde_json::json!({ "section": section })),
        }
    }

    /// Create a close notification.
    pub fn close() -> Self {
        Self {
            msg_type: CONTROL_CLOSE.to_string(),
            payload: None,
        }
    }

    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a CONTROL packet payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the payload of a reply, checking that it answers `expected`.
    pub fn into_payload<T: DeserializeOwned>(self, expected: &str) -> Result<T> {
        if self.msg_type != expected {
            return Err(DeviceError::Malformed(format!(
                "expected '{expected}' reply, got '{}'",
                self.msg_type
            )));
        }
        let payload = self.payload.ok_or_else(|| {
            DeviceError::Malformed(format!("'{expected}' reply carries no payload"))
        })?;
        Ok(serde_json::from_value(payload)?)
    }
}
