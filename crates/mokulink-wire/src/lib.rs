//! Length-prefixed packet framing with channel multiplexing for the device link.
//!
//! Every packet on the link is framed with:
//! - A 2-byte magic number ("MK") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID for multiplexing
//!
//! Register transactions, control requests and frame payloads share one
//! connection; the channel ID tells them apart.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{CONTROL, DATA, DATALOG, ERROR, REGISTERS};
pub use codec::{Packet, PacketDecoder, PacketHeader, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC};
pub use error::{PacketError, Result};
pub use reader::PacketReader;
pub use writer::PacketWriter;
