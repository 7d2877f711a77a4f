//! One device connection with at most one attached instrument.
//!
//! A [`Session`] owns the transport, the commit engine and the frame stream.
//! [`Session::attach_instrument`] deploys an instrument and hands back a
//! [`Controller`], the caller's handle for staging, committing and reading
//! frames. Attaching another instrument (or detaching, or closing) makes
//! every earlier controller stale: its shadow is invalidated and further
//! calls fail with [`MokuError::NotDeployed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use mokulink_transport::{DatalogStatus, Transport};
use tracing::{debug, info, warn};

use crate::codec::{DataFrame, FrameScaling};
use crate::commit::{CommitEngine, CommitReceipt, EpochClock};
use crate::config::SessionConfig;
use crate::error::{MokuError, Result};
use crate::instrument::{AttachContext, Calibration, Instrument};
use crate::lock;
use crate::stream::FrameStream;
use crate::transport::SharedTransport;

struct Slot {
    generation: u64,
    instrument: Option<Arc<Mutex<dyn Instrument>>>,
    name: Option<&'static str>,
}

struct SessionInner {
    transport: Arc<SharedTransport>,
    engine: CommitEngine,
    stream: FrameStream,
    slot: Mutex<Slot>,
    /// Held shared by commits and exclusively by attach, detach and close,
    /// so no commit can straddle an instrument change.
    lifecycle: RwLock<()>,
    config: SessionConfig,
    closed: AtomicBool,
}

impl SessionInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(MokuError::invalid("session is closed"))
        } else {
            Ok(())
        }
    }

    fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lifecycle.read().unwrap_or_else(|p| p.into_inner())
    }

    fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lifecycle.write().unwrap_or_else(|p| p.into_inner())
    }

    fn current(&self) -> Option<(u64, Arc<Mutex<dyn Instrument>>)> {
        let slot = lock(&self.slot);
        slot.instrument
            .as_ref()
            .map(|instrument| (slot.generation, Arc::clone(instrument)))
    }

    fn is_current(&self, generation: u64) -> bool {
        let slot = lock(&self.slot);
        slot.generation == generation && slot.instrument.is_some()
    }

    /// Stop frames and invalidate whatever is attached. Caller holds the
    /// lifecycle lock exclusively.
    fn release(&self) -> Option<&'static str> {
        self.stream.stop();
        self.stream.flush();
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        let previous = slot.instrument.take();
        if let Some(instrument) = previous {
            lock(&instrument).shadow_mut().invalidate();
        }
        slot.name.take()
    }

    fn commit(&self, instrument: &Mutex<dyn Instrument>, generation: u64) -> Result<CommitReceipt> {
        self.ensure_open()?;
        let _shared = self.shared();
        self.commit_current(instrument, generation)
    }

    /// Commit with the lifecycle lock already held. The frame codec picks
    /// up the new scaling before any frame can be read under the new epoch.
    fn commit_current(
        &self,
        instrument: &Mutex<dyn Instrument>,
        generation: u64,
    ) -> Result<CommitReceipt> {
        if !self.is_current(generation) {
            return Err(MokuError::NotDeployed);
        }
        let stream = &self.stream;
        self.engine
            .commit_with(instrument, &self.transport, |committed| {
                if committed.streams_frames() {
                    stream.set_scaling(committed.frame_scaling());
                }
            })
    }

    fn set_running(
        &self,
        instrument: &Mutex<dyn Instrument>,
        generation: u64,
        running: bool,
    ) -> Result<CommitReceipt> {
        self.ensure_open()?;
        let _shared = self.shared();
        if !self.is_current(generation) {
            return Err(MokuError::NotDeployed);
        }
        let streams = {
            let mut guard = lock(instrument);
            guard
                .shadow_mut()
                .stage_raw("pause", u64::from(!running))?;
            guard.streams_frames()
        };
        let receipt = self.commit_current(instrument, generation)?;
        if streams {
            if running {
                self.stream.start()?;
            } else {
                self.stream.stop();
            }
        }
        info!(running, epoch = receipt.epoch, "acquisition state changed");
        Ok(receipt)
    }

    fn datalogger_status(&self) -> Result<DatalogStatus> {
        self.ensure_open()?;
        if self.current().is_none() {
            return Err(MokuError::NotDeployed);
        }
        let mut link = self.transport.acquire(self.config.commit_timeout)?;
        Ok(link.datalog_status()?)
    }
}

/// Connection to one device.
///
/// Cheap to share across threads by reference; controllers keep the session
/// alive internally.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(SharedTransport::new(transport));
        let clock = Arc::new(EpochClock::new());
        let engine = CommitEngine::new(Arc::clone(&clock), config.commit_timeout);
        let stream = FrameStream::new(
            Arc::clone(&transport),
            clock,
            FrameScaling::new(0, Vec::new()),
            config.frame_buffer_length,
            config.frame_poll_interval,
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                transport,
                engine,
                stream,
                slot: Mutex::new(Slot {
                    generation: 0,
                    instrument: None,
                    name: None,
                }),
                lifecycle: RwLock::new(()),
                config,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Deploy `instrument` and make it the attached one.
    ///
    /// Any previous controller is invalidated and the frame stream stopped
    /// before the deploy. With the default configuration the device
    /// registers are read into the new shadow and the instrument defaults
    /// are committed before this returns.
    pub fn attach_instrument<I: Instrument>(&self, instrument: I) -> Result<Controller<I>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let _exclusive = inner.exclusive();
        if let Some(previous) = inner.release() {
            info!(instrument = previous, "detached for new instrument");
        }

        let mut instrument = instrument;
        let name = instrument.name();
        let id = instrument.id();
        let calibration = {
            let mut link = inner.transport.acquire(inner.config.commit_timeout)?;
            let version = link.deploy(id).map_err(MokuError::from_deploy)?;
            info!(instrument = name, id, version, "instrument deployed");

            if inner.config.sync_on_attach {
                let addresses = instrument.shadow().map().addresses();
                let words = link.read_registers(&addresses)?;
                debug!(instrument = name, registers = words.len(), "registers synced");
                instrument.shadow_mut().sync(&words);
            }

            match link.properties("calibration") {
                Ok(entries) => Calibration::from_properties(&entries),
                Err(err) => {
                    warn!(instrument = name, error = %err, "cannot read calibration");
                    Calibration::default()
                }
            }
        };
        instrument.attach(&AttachContext {
            calibration,
            datalog_rate_threshold: inner.config.datalog_rate_threshold,
        });

        let streams = instrument.streams_frames();
        let instrument = Arc::new(Mutex::new(instrument));
        let generation = {
            let mut slot = lock(&inner.slot);
            let shared: Arc<Mutex<dyn Instrument>> = instrument.clone();
            slot.instrument = Some(shared);
            slot.name = Some(name);
            slot.generation
        };

        let started: Result<()> = (|| {
            if inner.config.apply_defaults {
                lock(&instrument).set_defaults()?;
                let receipt = inner.commit_current(&*instrument, generation)?;
                debug!(instrument = name, epoch = receipt.epoch, "defaults committed");
            }
            if streams {
                inner.stream.set_scaling(lock(&instrument).frame_scaling());
                inner.stream.start()?;
            }
            Ok(())
        })();
        if let Err(err) = started {
            warn!(instrument = name, error = %err, "attach failed");
            inner.release();
            return Err(err);
        }
        info!(instrument = name, generation, "instrument attached");

        Ok(Controller {
            session: Arc::clone(inner),
            instrument,
            generation,
        })
    }

    /// Invalidate the attached instrument, if any, and stop the stream.
    pub fn detach_instrument(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let _exclusive = self.inner.exclusive();
        if let Some(name) = self.inner.release() {
            info!(instrument = name, "instrument detached");
        }
        Ok(())
    }

    /// Commit whatever is staged on the attached instrument.
    pub fn commit(&self) -> Result<CommitReceipt> {
        self.inner.ensure_open()?;
        let (generation, instrument) = self.inner.current().ok_or(MokuError::NotDeployed)?;
        self.inner.commit(&instrument, generation)
    }

    pub fn datalogger_status(&self) -> Result<DatalogStatus> {
        self.inner.datalogger_status()
    }

    /// Epoch of the last acknowledged commit; 0 before the first one.
    pub fn current_epoch(&self) -> u64 {
        self.inner.engine.epoch()
    }

    pub fn instrument_name(&self) -> Option<&'static str> {
        lock(&self.inner.slot).name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the stream, invalidate the attached instrument and close the
    /// transport. Closing an already closed session does nothing.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _exclusive = self.inner.exclusive();
        self.inner.release();
        let mut link = self.inner.transport.acquire(self.inner.config.commit_timeout)?;
        link.close()?;
        info!("session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(error = %err, "close on drop failed");
        }
    }
}

/// Handle to an attached instrument.
///
/// Staging goes through [`configure`](Self::configure), which validates and
/// stages under the instrument lock without touching the device. Nothing
/// reaches the device until [`commit`](Self::commit).
pub struct Controller<I: Instrument> {
    session: Arc<SessionInner>,
    instrument: Arc<Mutex<I>>,
    generation: u64,
}

impl<I: Instrument> Controller<I> {
    fn ensure_current(&self) -> Result<()> {
        self.session.ensure_open()?;
        if self.session.is_current(self.generation) {
            Ok(())
        } else {
            Err(MokuError::NotDeployed)
        }
    }

    /// Stage changes on the instrument.
    ///
    /// ```ignore
    /// scope.configure(|osc| {
    ///     osc.set_timebase(-1e-3, 1e-3)?;
    ///     osc.set_trigger(TriggerSource::Input(Channel::Ch1), Edge::Rising, 0.1)
    /// })?;
    /// ```
    pub fn configure<R>(&self, f: impl FnOnce(&mut I) -> Result<R>) -> Result<R> {
        self.ensure_current()?;
        f(&mut lock(&self.instrument))
    }

    /// Inspect the instrument's current (staged-over-committed) view.
    pub fn read<R>(&self, f: impl FnOnce(&I) -> R) -> R {
        f(&lock(&self.instrument))
    }

    /// Send everything staged as one transaction.
    pub fn commit(&self) -> Result<CommitReceipt> {
        let instrument: &Mutex<dyn Instrument> = &*self.instrument;
        self.session.commit(instrument, self.generation)
    }

    /// Newest frame acquired under the last committed configuration.
    pub fn get_frame(&self, timeout: Duration) -> Result<DataFrame> {
        self.ensure_current()?;
        let (streams, name) = self.read(|i| (i.streams_frames(), i.name()));
        if !streams {
            return Err(MokuError::invalid(format!("{name} does not produce frames")));
        }
        self.session.stream.get_frame(timeout)
    }

    /// Pause or resume acquisition.
    ///
    /// Stages the instrument's `pause` flag and commits it, together with
    /// anything else already staged. Once the device acknowledges, the
    /// frame stream is stopped or restarted to match. A failed commit
    /// leaves the stream as it was.
    pub fn set_running(&self, running: bool) -> Result<CommitReceipt> {
        let instrument: &Mutex<dyn Instrument> = &*self.instrument;
        self.session
            .set_running(instrument, self.generation, running)
    }

    /// True while attached, unpaused on the device, and, for frame
    /// instruments, with the frame stream running.
    pub fn is_running(&self) -> bool {
        if !self.is_attached() {
            return false;
        }
        let (paused, streams) = self.read(|i| {
            (
                i.shadow().read_committed_raw("pause").unwrap_or(1) != 0,
                i.streams_frames(),
            )
        });
        !paused && (!streams || self.session.stream.is_running())
    }

    pub fn flush_frames(&self) -> Result<()> {
        self.ensure_current()?;
        self.session.stream.flush();
        Ok(())
    }

    pub fn set_buffer_length(&self, length: usize) -> Result<()> {
        self.ensure_current()?;
        self.session.stream.set_buffer_length(length)
    }

    pub fn datalogger_status(&self) -> Result<DatalogStatus> {
        self.ensure_current()?;
        self.session.datalogger_status()
    }

    pub fn is_attached(&self) -> bool {
        !self.session.closed.load(Ordering::Acquire) && self.session.is_current(self.generation)
    }
}
