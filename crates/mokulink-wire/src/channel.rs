//! Link channel IDs.
//!
//! Channels 0-255 are reserved for the device protocol.

/// JSON control requests (deploy, properties, datalogger status).
pub const CONTROL: u16 = 0;

/// Binary register transactions and register reads.
pub const REGISTERS: u16 = 1;

/// Raw frame payloads pushed by the device.
pub const DATA: u16 = 2;

/// Datalogger start/stop acknowledgements.
pub const DATALOG: u16 = 3;

/// Asynchronous device error notifications.
pub const ERROR: u16 = 4;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        REGISTERS => "REGISTERS",
        DATA => "DATA",
        DATALOG => "DATALOG",
        ERROR => "ERROR",
        _ => "RESERVED",
    }
}

/// Returns true if the channel carries a reply to a host request.
pub fn is_reply_channel(id: u16) -> bool {
    matches!(id, CONTROL | REGISTERS | DATALOG)
}
