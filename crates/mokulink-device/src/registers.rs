//! Binary register transactions on the REGISTERS channel.
//!
//! Request: `[0x47, state_id, count]` followed by `count` entries. Writes are
//! `(address | 0x80, value u32 LE)`, reads are a bare address byte. A write
//! ends with the datalogger mode block (see [`crate::datalog`]).
//! Reply: `[0x47, status, count]`, followed for reads by `count`
//! `(address, value u32 LE)` pairs. A write acknowledgement carries no words;
//! a non-zero status means the device applied nothing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mokulink_transport::{RegisterTransaction, RegisterWord};

use crate::datalog;
use crate::error::{DeviceError, Result};

/// Opcode shared by register reads and writes.
pub const OP_REGISTERS: u8 = 0x47;

const WRITE_FLAG: u8 = 0x80;
const MAX_WORDS: usize = u8::MAX as usize;
const WORD_SIZE: usize = 5;
const HEADER_SIZE: usize = 3;

/// Encode a whole transaction, register words and datalogger mode, as one
/// write request.
pub fn encode_write(txn: &RegisterTransaction) -> Result<Bytes> {
    check_count(txn.writes.len())?;
    let mut buf = BytesMut::with_capacity(
        HEADER_SIZE + txn.writes.len() * WORD_SIZE + datalog::START_BLOCK_SIZE,
    );
    buf.put_u8(OP_REGISTERS);
    buf.put_u8(txn.state_id);
    buf.put_u8(txn.writes.len() as u8);
    for word in &txn.writes {
        check_address(word.address)?;
        buf.put_u8(word.address | WRITE_FLAG);
        buf.put_u32_le(word.value);
    }
    datalog::put_mode(&mut buf, &txn.datalog);
    Ok(buf.freeze())
}

/// Check a write acknowledgement.
pub fn decode_write_ack(reply: &[u8]) -> Result<()> {
    let (status, count) = parse_header(reply)?;
    if status != 0 {
        return Err(DeviceError::Rejected {
            operation: "register write",
            code: status,
        });
    }
    if count != 0 {
        return Err(DeviceError::Malformed(format!(
            "write acknowledgement carries {count} words"
        )));
    }
    Ok(())
}

/// Encode a read of `addresses`.
pub fn encode_read(addresses: &[u8]) -> Result<Bytes> {
    check_count(addresses.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + addresses.len());
    buf.put_u8(OP_REGISTERS);
    buf.put_u8(0);
    buf.put_u8(addresses.len() as u8);
    for &address in addresses {
        check_address(address)?;
        buf.put_u8(address);
    }
    Ok(buf.freeze())
}

/// Decode the reply to a read of `addresses`, in request order.
pub fn decode_read_reply(reply: &[u8], addresses: &[u8]) -> Result<Vec<RegisterWord>> {
    let (status, count) = parse_header(reply)?;
    if status != 0 {
        return Err(DeviceError::Rejected {
            operation: "register read",
            code: status,
        });
    }
    if count as usize != addresses.len() || reply.len() != HEADER_SIZE + addresses.len() * WORD_SIZE
    {
        return Err(DeviceError::Malformed(format!(
            "register read returned {count} words in {} bytes, expected {}",
            reply.len(),
            addresses.len()
        )));
    }

    let mut body = &reply[HEADER_SIZE..];
    let mut words = Vec::with_capacity(addresses.len());
    for &expected in addresses {
        let address = body.get_u8();
        let value = body.get_u32_le();
        if address != expected {
            return Err(DeviceError::Malformed(format!(
                "register read answered address {address}, expected {expected}"
            )));
        }
        words.push(RegisterWord::new(address, value));
    }
    Ok(words)
}

fn parse_header(reply: &[u8]) -> Result<(u8, u8)> {
    if reply.len() < HEADER_SIZE {
        return Err(DeviceError::Malformed(format!(
            "register reply too short ({} bytes)",
            reply.len()
        )));
    }
    if reply[0] != OP_REGISTERS {
        return Err(DeviceError::Malformed(format!(
            "register reply opcode {:#04x}",
            reply[0]
        )));
    }
    Ok((reply[1], reply[2]))
}

fn check_count(count: usize) -> Result<()> {
    if count > MAX_WORDS {
        return Err(DeviceError::InvalidRequest(format!(
            "{count} registers in one request (max {MAX_WORDS})"
        )));
    }
    Ok(())
}

fn check_address(address: u8) -> Result<()> {
    if address & WRITE_FLAG != 0 {
        return Err(DeviceError::InvalidRequest(format!(
            "register address {address} out of range"
        )));
    }
    Ok(())
}
