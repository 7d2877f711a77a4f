//! Instrument control core for mokulink.
//!
//! Configuration is staged into a per-instrument [`ShadowState`] and only
//! reaches the device through [`CommitEngine::commit`], which sends every
//! dirty field as one [`Transaction`]. A background [`FrameStream`] pulls
//! and decodes data frames meanwhile, and hands out the newest frame taken
//! under the last acknowledged configuration.
//!
//! [`Session`] ties these together over one [`mokulink_transport::Transport`]:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mokulink_instrument::{Channel, Oscilloscope, Session, SessionConfig, SineWave, Synthesizer};
//! # fn run(transport: Box<dyn mokulink_transport::Transport>) -> mokulink_instrument::Result<()> {
//! let session = Session::new(transport, SessionConfig::default())?;
//! let scope = session.attach_instrument(Oscilloscope::new())?;
//! scope.configure(|osc| {
//!     osc.set_timebase(-1e-3, 1e-3)?;
//!     osc.synth_sinewave(Channel::Ch1, SineWave::new(0.5, 10e3))
//! })?;
//! scope.commit()?;
//! let frame = scope.get_frame(Duration::from_secs(1))?;
//! println!("{} samples", frame.samples_per_channel());
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod instrument;
pub mod modulation;
pub mod oscilloscope;
pub mod register;
pub mod session;
pub mod shadow;
pub mod siggen;
pub mod stream;
pub mod synth;
pub mod transport;

pub use codec::{encode_frame, DataFrame, FrameCodec, FrameHeader, FrameScaling};
pub use commit::{CommitEngine, CommitReceipt, EpochClock, EpochMark, Transaction};
pub use config::SessionConfig;
pub use error::{MokuError, Result};
pub use instrument::{AttachContext, Calibration, Channel, Frontend, FrontendConfig, Instrument};
pub use modulation::{ModulationChain, ModulationSource, ModulationType};
pub use oscilloscope::{DataSource, Edge, Oscilloscope, TriggerMode, TriggerSource, XMode};
pub use register::{RegisterField, RegisterMap};
pub use session::{Controller, Session};
pub use shadow::{ShadowState, Value};
pub use siggen::SignalGenerator;
pub use stream::{FrameQueue, FrameStream, StreamState};
pub use synth::{SineWave, SquareWave, Synthesizer, Waveform};
pub use transport::SharedTransport;

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
/// Every guarded mutation is validated before it is applied, so the data
/// stays consistent.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
