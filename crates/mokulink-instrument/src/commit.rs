//! Atomic commit of staged configuration.
//!
//! A commit snapshots every dirty field of the attached instrument into one
//! [`Transaction`], sends it as a single register write and, only once the
//! device acknowledges it, adopts it as the committed state. A failed write
//! leaves the shadow exactly as it was so the caller can retry.
//!
//! Adoption happens while the commit still holds the transport. No frame
//! poll can run between the acknowledgement and the new epoch, so every
//! frame read after the epoch moves is decoded with the new configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mokulink_transport::{DatalogCommand, RegisterTransaction, RegisterWord};
use tracing::{debug, info, warn};

use crate::error::{MokuError, Result};
use crate::instrument::Instrument;
use crate::lock;
use crate::transport::SharedTransport;

/// One staged field captured in a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEntry {
    pub field: &'static str,
    pub raw: u64,
}

/// An ordered set of register writes snapshotted at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub(crate) epoch: u64,
    pub(crate) state_id: u8,
    pub(crate) entries: Vec<TransactionEntry>,
    pub(crate) writes: Vec<RegisterWord>,
    pub(crate) datalog: DatalogCommand,
}

impl Transaction {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state_id(&self) -> u8 {
        self.state_id
    }

    /// Dirty fields in declaration order.
    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    /// Whole register words, state word last.
    pub fn writes(&self) -> &[RegisterWord] {
        &self.writes
    }

    pub fn datalog(&self) -> &DatalogCommand {
        &self.datalog
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.field).collect()
    }

    pub fn to_wire(&self) -> RegisterTransaction {
        RegisterTransaction {
            state_id: self.state_id,
            writes: self.writes.clone(),
            datalog: self.datalog.clone(),
        }
    }
}

/// The most recent acknowledged commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochMark {
    pub epoch: u64,
    pub acknowledged_at: Option<Instant>,
}

/// Configuration epoch shared between the commit engine and the frame
/// stream.
#[derive(Debug, Default)]
pub struct EpochClock {
    mark: Mutex<EpochMark>,
}

impl EpochClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> EpochMark {
        *lock(&self.mark)
    }

    pub(crate) fn advance(&self, epoch: u64, acknowledged_at: Instant) {
        *lock(&self.mark) = EpochMark {
            epoch,
            acknowledged_at: Some(acknowledged_at),
        };
    }
}

/// What an acknowledged commit applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub epoch: u64,
    pub state_id: u8,
    pub fields: Vec<&'static str>,
    pub acknowledged_at: Instant,
}

/// Serializes commits and tracks the configuration epoch.
#[derive(Debug)]
pub struct CommitEngine {
    in_flight: AtomicBool,
    clock: Arc<EpochClock>,
    timeout: Duration,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CommitEngine {
    /// `timeout` bounds how long a commit waits for the transport.
    pub fn new(clock: Arc<EpochClock>, timeout: Duration) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            clock,
            timeout,
        }
    }

    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    pub fn epoch(&self) -> u64 {
        self.clock.current().epoch
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InFlight(&self.in_flight))
            .map_err(|_| MokuError::invalid("a commit is already in flight"))
    }

    /// Send every dirty field of `instrument` as one transaction.
    pub fn commit(
        &self,
        instrument: &Mutex<dyn Instrument>,
        transport: &SharedTransport,
    ) -> Result<CommitReceipt> {
        self.commit_with(instrument, transport, |_| {})
    }

    /// Like [`commit`](Self::commit), running `on_ack` with the freshly
    /// committed instrument before the transport is released.
    pub fn commit_with(
        &self,
        instrument: &Mutex<dyn Instrument>,
        transport: &SharedTransport,
        on_ack: impl FnOnce(&dyn Instrument),
    ) -> Result<CommitReceipt> {
        let _in_flight = self.begin()?;

        let epoch = self.clock.current().epoch + 1;
        let state_id = (epoch % 256) as u8;
        let transaction = {
            let mut guard = lock(instrument);
            guard.before_commit()?;
            guard.shadow().transaction(epoch, state_id)?
        };
        debug!(
            epoch,
            state_id,
            fields = ?transaction.fields(),
            words = transaction.writes.len(),
            "committing"
        );

        let started = Instant::now();
        let mut link = transport.acquire(self.timeout)?;
        if let Err(err) = link.write_transaction(&transaction.to_wire()) {
            warn!(epoch, error = %err, "commit failed, staged values kept");
            return Err(err.into());
        }
        let acknowledged_at = Instant::now();
        {
            let mut guard = lock(instrument);
            guard.shadow_mut().apply(&transaction);
            self.clock.advance(epoch, acknowledged_at);
            on_ack(&*guard);
        }
        drop(link);

        let fields = transaction.fields();
        info!(
            epoch,
            state_id,
            fields = fields.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "commit acknowledged"
        );
        Ok(CommitReceipt {
            epoch,
            state_id,
            fields,
            acknowledged_at,
        })
    }
}
