//! Scriptable in-memory [`Transport`] for tests.
//!
//! A [`MockTransport`] is handed to the code under test while the paired
//! [`MockHandle`] stays with the test to queue frame payloads, inject
//! failures and inspect what was written.
//!
//! ```
//! use mokulink_transport::mock::MockTransport;
//! use mokulink_transport::{RegisterTransaction, RegisterWord, Transport};
//!
//! let (mut transport, handle) = MockTransport::new();
//! let txn = RegisterTransaction {
//!     writes: vec![RegisterWord::new(7, 42)],
//!     ..RegisterTransaction::default()
//! };
//! transport.write_transaction(&txn).unwrap();
//! assert_eq!(handle.register(7), Some(42));
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::traits::{
    DatalogCommand, DatalogState, DatalogStatus, FramePayload, RegisterTransaction, RegisterWord,
    Transport,
};

/// Failure injected into the next transaction writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The device never acknowledges.
    Timeout,
    /// The device refuses with the given code.
    Rejected(u8),
    /// The link drops.
    Disconnect,
}

impl MockFailure {
    fn into_error(self, operation: &'static str) -> TransportError {
        match self {
            MockFailure::Timeout => TransportError::Timeout(Duration::from_millis(0)),
            MockFailure::Rejected(code) => TransportError::Rejected { operation, code },
            MockFailure::Disconnect => TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )),
        }
    }
}

#[derive(Default)]
struct MockInner {
    frames: VecDeque<FramePayload>,
    frame_failures: VecDeque<MockFailure>,
    transactions: Vec<RegisterTransaction>,
    registers: BTreeMap<u8, u32>,
    properties: BTreeMap<String, String>,
    write_failures: VecDeque<MockFailure>,
    deploy_failure: Option<u8>,
    deployed: Option<u8>,
    deploy_count: usize,
    write_latency: Duration,
    datalog: DatalogStatus,
    closed: bool,
}

struct MockState {
    inner: Mutex<MockInner>,
    frames_ready: Condvar,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// In-memory device double.
pub struct MockTransport {
    state: Arc<MockState>,
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Create a transport and its inspection handle.
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(MockState {
            inner: Mutex::new(MockInner::default()),
            frames_ready: Condvar::new(),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }

    fn ensure_open(inner: &MockInner) -> Result<()> {
        if inner.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Transport for MockTransport {
    fn deploy(&mut self, instrument_id: u8) -> Result<u16> {
        let mut inner = self.state.lock();
        Self::ensure_open(&inner)?;
        if let Some(code) = inner.deploy_failure.take() {
            return Err(TransportError::Rejected {
                operation: "deploy",
                code,
            });
        }
        inner.deployed = Some(instrument_id);
        inner.deploy_count += 1;
        Ok(1)
    }

    fn write_transaction(&mut self, transaction: &RegisterTransaction) -> Result<()> {
        let latency = {
            let inner = self.state.lock();
            Self::ensure_open(&inner)?;
            inner.write_latency
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut inner = self.state.lock();
        if let Some(failure) = inner.write_failures.pop_front() {
            return Err(failure.into_error("register write"));
        }
        for word in &transaction.writes {
            inner.registers.insert(word.address, word.value);
        }
        match &transaction.datalog {
            DatalogCommand::Unchanged => {}
            DatalogCommand::Start(_) => {
                inner.datalog.state = DatalogState::Running;
                inner.datalog.bytes_transferred = 0;
            }
            DatalogCommand::Stop => inner.datalog.state = DatalogState::Idle,
        }
        inner.transactions.push(transaction.clone());
        Ok(())
    }

    fn read_registers(&mut self, addresses: &[u8]) -> Result<Vec<RegisterWord>> {
        let inner = self.state.lock();
        Self::ensure_open(&inner)?;
        Ok(addresses
            .iter()
            .map(|&address| {
                RegisterWord::new(address, inner.registers.get(&address).copied().unwrap_or(0))
            })
            .collect())
    }

    fn read_frame_payload(&mut self, timeout: Duration) -> Result<Option<FramePayload>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.lock();
        loop {
            Self::ensure_open(&inner)?;
            if let Some(failure) = inner.frame_failures.pop_front() {
                return Err(failure.into_error("frame read"));
            }
            if let Some(frame) = inner.frames.pop_front() {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            inner = self
                .state
                .frames_ready
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    fn properties(&mut self, section: &str) -> Result<Vec<(String, String)>> {
        let inner = self.state.lock();
        Self::ensure_open(&inner)?;
        let prefix = format!("{section}.");
        Ok(inner
            .properties
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn datalog_status(&mut self) -> Result<DatalogStatus> {
        let inner = self.state.lock();
        Self::ensure_open(&inner)?;
        Ok(inner.datalog.clone())
    }

    fn close(&mut self) -> Result<()> {
        let mut inner = self.state.lock();
        inner.closed = true;
        self.state.frames_ready.notify_all();
        Ok(())
    }
}

impl MockHandle {
    /// Queue a raw frame payload for the next `read_frame_payload`. The
    /// payload counts as received now, not when it is read.
    pub fn push_frame(&self, payload: impl Into<Bytes>) {
        let mut inner = self.state.lock();
        inner.frames.push_back(FramePayload::now(payload.into()));
        self.state.frames_ready.notify_all();
    }

    /// Number of queued, not yet read, frame payloads.
    pub fn pending_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Make the next frame read fail.
    pub fn fail_next_frame_read(&self, failure: MockFailure) {
        let mut inner = self.state.lock();
        inner.frame_failures.push_back(failure);
        self.state.frames_ready.notify_all();
    }

    /// Make the next `count` transaction writes fail.
    pub fn fail_next_writes(&self, count: usize, failure: MockFailure) {
        let mut inner = self.state.lock();
        for _ in 0..count {
            inner.write_failures.push_back(failure);
        }
    }

    /// Make the next deploy fail with the given device code.
    pub fn fail_next_deploy(&self, code: u8) {
        self.state.lock().deploy_failure = Some(code);
    }

    /// Delay every transaction write by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.state.lock().write_latency = latency;
    }

    /// Set a device property, e.g. `calibration.AG-1M-H-D-1`.
    pub fn set_property(&self, key: &str, value: &str) {
        self.state
            .lock()
            .properties
            .insert(key.to_string(), value.to_string());
    }

    /// Set a register on the simulated device.
    pub fn set_register(&self, address: u8, value: u32) {
        self.state.lock().registers.insert(address, value);
    }

    /// Current value of a register on the simulated device.
    pub fn register(&self, address: u8) -> Option<u32> {
        self.state.lock().registers.get(&address).copied()
    }

    /// Every acknowledged transaction, oldest first.
    pub fn transactions(&self) -> Vec<RegisterTransaction> {
        self.state.lock().transactions.clone()
    }

    /// The most recent acknowledged transaction.
    pub fn last_transaction(&self) -> Option<RegisterTransaction> {
        self.state.lock().transactions.last().cloned()
    }

    /// Instrument id of the last successful deploy.
    pub fn deployed_instrument(&self) -> Option<u8> {
        self.state.lock().deployed
    }

    /// Number of successful deploys.
    pub fn deploy_count(&self) -> usize {
        self.state.lock().deploy_count
    }

    /// Replace the datalogger status the device reports.
    pub fn set_datalog_status(&self, status: DatalogStatus) {
        self.state.lock().datalog = status;
    }

    /// True once the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
