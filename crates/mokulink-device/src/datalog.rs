//! Datalogger encoding.
//!
//! Start and stop are not requests of their own: they ride at the end of a
//! register write as a mode block, so one acknowledgement covers registers
//! and datalogger together. The mode block is a single byte (0 unchanged,
//! 1 start, 2 stop); start is followed by storage (`b'e'` SD card, `b'i'`
//! internal), duration in ms (u32 LE), a channel mask and the sample rate
//! (f64 LE).
//!
//! The DATALOG channel only answers status queries: request `[0x53, seq]`,
//! reply `[0x53, seq, state, bytes u64 LE, name_len u16 LE, name]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mokulink_transport::{DatalogCommand, DatalogState, DatalogStatus, DatalogStorage};

use crate::error::{DeviceError, Result};

/// Opcode for datalogger status requests.
pub const OP_DATALOG: u8 = 0x53;

pub const MODE_UNCHANGED: u8 = 0;
pub const MODE_START: u8 = 1;
pub const MODE_STOP: u8 = 2;

/// Size of a start mode block, mode byte included.
pub const START_BLOCK_SIZE: usize = 15;

const STATUS_HEADER_SIZE: usize = 13;

/// Append the mode block for `command` to a register write.
pub fn put_mode(buf: &mut BytesMut, command: &DatalogCommand) {
    match command {
        DatalogCommand::Unchanged => buf.put_u8(MODE_UNCHANGED),
        DatalogCommand::Stop => buf.put_u8(MODE_STOP),
        DatalogCommand::Start(settings) => {
            buf.put_u8(MODE_START);
            buf.put_u8(match settings.storage {
                DatalogStorage::SdCard => b'e',
                DatalogStorage::Internal => b'i',
            });
            buf.put_u32_le(u32::try_from(settings.duration.as_millis()).unwrap_or(u32::MAX));
            buf.put_u8(u8::from(settings.channels[0]) | (u8::from(settings.channels[1]) << 1));
            buf.put_f64_le(settings.sample_rate);
        }
    }
}

pub fn encode_status(seq: u8) -> Bytes {
    Bytes::copy_from_slice(&[OP_DATALOG, seq])
}

/// Decode the reply to status request `seq`.
pub fn decode_status(reply: &[u8], seq: u8) -> Result<DatalogStatus> {
    if reply.len() < STATUS_HEADER_SIZE {
        return Err(DeviceError::Malformed(format!(
            "datalogger reply too short ({} bytes)",
            reply.len()
        )));
    }

    let mut buf = reply;
    let op = buf.get_u8();
    let reply_seq = buf.get_u8();
    let code = buf.get_u8();
    let bytes_transferred = buf.get_u64_le();
    let name_len = buf.get_u16_le() as usize;

    if op != OP_DATALOG || reply_seq != seq {
        return Err(DeviceError::Malformed(format!(
            "datalogger reply ({op:#04x}, seq {reply_seq}) does not answer seq {seq}"
        )));
    }
    if buf.remaining() != name_len {
        return Err(DeviceError::Malformed(format!(
            "datalogger file name length {name_len}, {} bytes present",
            buf.remaining()
        )));
    }

    let file_name = match name_len {
        0 => None,
        _ => Some(
            std::str::from_utf8(buf)
                .map_err(|_| DeviceError::Malformed("datalogger file name is not utf-8".into()))?
                .to_string(),
        ),
    };

    Ok(DatalogStatus {
        state: match code {
            0 => DatalogState::Idle,
            1 => DatalogState::Running,
            2 => DatalogState::Complete,
            other => DatalogState::Failed(other),
        },
        bytes_transferred,
        file_name,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mokulink_transport::DatalogSettings;

    use super::*;

    fn reply(seq: u8, state: u8, bytes: u64, name: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_DATALOG);
        buf.put_u8(seq);
        buf.put_u8(state);
        buf.put_u64_le(bytes);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name.as_bytes());
        buf.to_vec()
    }

    #[test]
    fn start_block_layout() {
        let mut buf = BytesMut::new();
        put_mode(
            &mut buf,
            &DatalogCommand::Start(DatalogSettings {
                duration: Duration::from_secs(2),
                channels: [false, true],
                storage: DatalogStorage::Internal,
                sample_rate: 1000.0,
            }),
        );
        assert_eq!(buf.len(), START_BLOCK_SIZE);
        assert_eq!(&buf[..2], &[MODE_START, b'i']);
        assert_eq!(&buf[2..6], &2000u32.to_le_bytes());
        assert_eq!(buf[6], 0b10);
        assert_eq!(&buf[7..], &1000.0f64.to_le_bytes());
    }

    #[test]
    fn unchanged_and_stop_are_one_byte() {
        let mut buf = BytesMut::new();
        put_mode(&mut buf, &DatalogCommand::Unchanged);
        put_mode(&mut buf, &DatalogCommand::Stop);
        assert_eq!(buf.as_ref(), &[MODE_UNCHANGED, MODE_STOP]);
    }

    #[test]
    fn status_reply_decodes() {
        assert_eq!(encode_status(3).as_ref(), &[0x53, 3]);
        let status = decode_status(&reply(3, 1, 4096, "log0001.li"), 3).unwrap();
        assert_eq!(status.state, DatalogState::Running);
        assert_eq!(status.bytes_transferred, 4096);
        assert_eq!(status.file_name.as_deref(), Some("log0001.li"));

        let status = decode_status(&reply(4, 9, 0, ""), 4).unwrap();
        assert_eq!(status.state, DatalogState::Failed(9));
        assert_eq!(status.file_name, None);
    }

    #[test]
    fn mismatched_reply_is_malformed() {
        assert!(matches!(
            decode_status(&reply(2, 0, 0, ""), 3),
            Err(DeviceError::Malformed(_))
        ));
        let mut truncated = reply(3, 0, 0, "name");
        truncated.pop();
        assert!(decode_status(&truncated, 3).is_err());
    }
}
