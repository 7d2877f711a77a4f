//! Concrete device link for mokulink.
//!
//! [`DeviceLink`] speaks the instrument's control protocol over one packet
//! connection: a JSON deploy handshake and property queries on the CONTROL
//! channel, binary register transactions on REGISTERS, datalogger commands on
//! DATALOG and raw frame payloads on DATA. It implements
//! [`mokulink_transport::Transport`], so the instrument layer never sees any of
//! this.

pub mod config;
pub mod connector;
pub mod control;
pub mod datalog;
pub mod deploy;
pub mod error;
pub mod link;
pub mod registers;

pub use config::LinkConfig;
pub use connector::{connect, connect_by_name, connect_with_config};
pub use control::{
    ControlMessage, PropertiesReply, CONTROL_CLOSE, CONTROL_DEPLOY, CONTROL_PROPERTIES,
};
pub use deploy::{DeployRequest, DeployResponse, DeployResult};
pub use error::{DeviceError, Result};
pub use link::DeviceLink;
