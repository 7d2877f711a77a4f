use std::time::Duration;

use mokulink_transport::TransportError;

/// Errors surfaced by instrument control, commits and frame delivery.
#[derive(Debug, thiserror::Error)]
pub enum MokuError {
    /// The transport failed or timed out during a commit, query or frame fetch.
    #[error("network error: {0}")]
    Network(TransportError),

    /// Deploying the instrument onto the device failed.
    #[error("deploy failed: {0}")]
    Deploy(String),

    /// A frame payload could not be decoded.
    #[error("malformed frame: {0}")]
    Stream(String),

    /// The call is not legal in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A value is outside the bounds the device accepts.
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    /// The operation needs an attached instrument.
    #[error("no instrument deployed")]
    NotDeployed,

    /// No frame arrived within the requested wait.
    #[error("no frame received within {0:?}")]
    FrameTimeout(Duration),

    /// The device could not be resolved to an address.
    #[error("device not found: {0}")]
    NotFound(String),

    /// Session configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MokuError {
    /// Map a transport failure that happened while deploying.
    ///
    /// A refusal from the device is a deploy failure; a broken link stays a
    /// network error.
    pub fn from_deploy(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { code, .. } => {
                MokuError::Deploy(format!("device refused instrument (code {code})"))
            }
            TransportError::Protocol(msg) => MokuError::Deploy(msg),
            other => MokuError::from(other),
        }
    }

    pub(crate) fn out_of_range(msg: impl Into<String>) -> Self {
        MokuError::ValueOutOfRange(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MokuError::InvalidOperation(msg.into())
    }
}

impl From<TransportError> for MokuError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(name) => MokuError::NotFound(name),
            other => MokuError::Network(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, MokuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_keeps_its_own_variant() {
        let err = MokuError::from(TransportError::NotFound("bench-moku".into()));
        assert!(matches!(err, MokuError::NotFound(ref n) if n == "bench-moku"));
    }

    #[test]
    fn timeout_is_network() {
        let err = MokuError::from(TransportError::Timeout(Duration::from_secs(1)));
        assert!(matches!(err, MokuError::Network(TransportError::Timeout(_))));
        assert!(err.to_string().starts_with("network error"));
    }

    #[test]
    fn deploy_refusal_is_deploy_error() {
        let err = MokuError::from_deploy(TransportError::Rejected {
            operation: "deploy",
            code: 3,
        });
        assert!(matches!(err, MokuError::Deploy(ref m) if m.contains("code 3")));

        let err = MokuError::from_deploy(TransportError::Closed);
        assert!(matches!(err, MokuError::Network(TransportError::Closed)));
    }
}
