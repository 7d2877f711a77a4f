use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Result;

/// One 32-bit device register word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterWord {
    /// Register address (0-127).
    pub address: u8,
    /// Full register contents.
    pub value: u32,
}

impl RegisterWord {
    /// Create a register word.
    pub fn new(address: u8, value: u32) -> Self {
        Self { address, value }
    }
}

/// Where the device persists datalogger samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatalogStorage {
    /// Removable SD card.
    #[default]
    SdCard,
    /// On-board flash.
    Internal,
}

/// Parameters of a device-side datalogging session.
#[derive(Debug, Clone, PartialEq)]
pub struct DatalogSettings {
    /// How long the device should log for. Zero means until stopped.
    pub duration: Duration,
    /// Per-channel enable, index 0 is channel 1.
    pub channels: [bool; 2],
    /// Target storage on the device.
    pub storage: DatalogStorage,
    /// Sample rate the device is acquiring at, in samples per second.
    pub sample_rate: f64,
}

/// Datalogger mode change carried by a register transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DatalogCommand {
    /// Leave the datalogger as it is.
    #[default]
    Unchanged,
    /// Begin persisting raw samples on the device.
    Start(DatalogSettings),
    /// Stop persisting samples.
    Stop,
}

/// One atomic configuration write.
///
/// The device applies every word and the datalogger command together, or
/// rejects the whole transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisterTransaction {
    /// 8-bit configuration state id echoed back in frame headers.
    pub state_id: u8,
    /// Register words in the order they must be applied.
    pub writes: Vec<RegisterWord>,
    /// Datalogger mode flag.
    pub datalog: DatalogCommand,
}

impl RegisterTransaction {
    /// True if the transaction carries neither register writes nor a datalogger change.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.datalog == DatalogCommand::Unchanged
    }
}

/// A raw frame payload and the moment the host received it.
///
/// The receive time is taken when the bytes come off the link, even if the
/// payload then waits in a buffer while a request completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    pub data: Bytes,
    pub received_at: Instant,
}

impl FramePayload {
    /// A payload received just now.
    pub fn now(data: Bytes) -> Self {
        Self {
            data,
            received_at: Instant::now(),
        }
    }
}

/// Datalogger activity reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatalogState {
    #[default]
    Idle,
    Running,
    Complete,
    /// Device-reported failure code.
    Failed(u8),
}

/// Snapshot of the device datalogger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatalogStatus {
    pub state: DatalogState,
    /// Bytes written to device storage so far.
    pub bytes_transferred: u64,
    /// Name of the file being written, if the device reported one.
    pub file_name: Option<String>,
}

/// Request/response and streaming exchange with one instrument.
///
/// Every method is one logical operation. Callers serialize access (one
/// operation at a time); implementations never interleave two operations on
/// the wire.
pub trait Transport: Send {
    /// Load and start the instrument with the given id. Returns the bitstream version.
    fn deploy(&mut self, instrument_id: u8) -> Result<u16>;

    /// Apply one register transaction. Returns once the device acknowledged it.
    fn write_transaction(&mut self, transaction: &RegisterTransaction) -> Result<()>;

    /// Read the current value of the given registers.
    fn read_registers(&mut self, addresses: &[u8]) -> Result<Vec<RegisterWord>>;

    /// Wait up to `timeout` for the next raw frame payload.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Payloads that came in
    /// while another operation held the link are returned first, stamped with
    /// their original receive time.
    fn read_frame_payload(&mut self, timeout: Duration) -> Result<Option<FramePayload>>;

    /// Read a named property section (e.g. `calibration`) as key/value pairs.
    fn properties(&mut self, section: &str) -> Result<Vec<(String, String)>>;

    /// Query the device datalogger.
    fn datalog_status(&mut self) -> Result<DatalogStatus>;

    /// Close the link. Further calls fail with `TransportError::Closed`.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transaction() {
        assert!(RegisterTransaction::default().is_empty());

        let txn = RegisterTransaction {
            datalog: DatalogCommand::Stop,
            ..RegisterTransaction::default()
        };
        assert!(!txn.is_empty());

        let txn = RegisterTransaction {
            writes: vec![RegisterWord::new(5, 1)],
            ..RegisterTransaction::default()
        };
        assert!(!txn.is_empty());
    }
}
