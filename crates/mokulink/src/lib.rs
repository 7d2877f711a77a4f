//! Host-side control and data acquisition for networked oscilloscope and
//! signal generator instruments.
//!
//! # Crate Structure
//!
//! - [`transport`]: Device byte stream, the `Transport` contract, address resolution, mock
//! - [`wire`]: Length-prefixed packet framing on the device link
//! - [`device`]: Concrete device link implementing `Transport`
//! - [`instrument`]: Shadow registers, atomic commits, frame stream and the instruments
//!
//! [`connect`] opens a device link and wraps it in a [`Session`]:
//!
//! ```no_run
//! use mokulink::{connect, Channel, SessionConfig, SignalGenerator, SineWave, Synthesizer};
//!
//! let session = connect("192.168.73.1:27184", SessionConfig::default())?;
//! let sg = session.attach_instrument(SignalGenerator::new())?;
//! sg.configure(|sg| sg.synth_sinewave(Channel::Ch1, SineWave::new(1.0, 1e6)))?;
//! sg.commit()?;
//! # Ok::<(), mokulink::MokuError>(())
//! ```

use std::net::ToSocketAddrs;

use mokulink_device::LinkConfig;
use mokulink_transport::{AddressResolver, TransportError};
use tracing::info;

#[cfg(feature = "logging")]
pub mod logging;

/// Re-export transport types.
pub mod transport {
    pub use mokulink_transport::*;
}

/// Re-export packet framing types.
pub mod wire {
    pub use mokulink_wire::*;
}

/// Re-export device link types.
pub mod device {
    pub use mokulink_device::*;
}

/// Re-export instrument control types.
pub mod instrument {
    pub use mokulink_instrument::*;
}

pub use mokulink_instrument::{
    Channel, Controller, DataFrame, DataSource, Edge, Frontend, FrontendConfig, Instrument,
    ModulationSource, ModulationType, MokuError, Oscilloscope, Result, Session, SessionConfig,
    SignalGenerator, SineWave, SquareWave, Synthesizer, TriggerMode, TriggerSource, XMode,
};

/// Connect to a device with the default link configuration.
pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug, config: SessionConfig) -> Result<Session> {
    connect_with(addr, LinkConfig::default(), config)
}

/// Connect with explicit link and session configuration.
pub fn connect_with(
    addr: impl ToSocketAddrs + std::fmt::Debug,
    link: LinkConfig,
    config: SessionConfig,
) -> Result<Session> {
    let link = mokulink_device::connect_with_config(addr, link).map_err(TransportError::from)?;
    info!(peer = ?link.peer_addr(), "session opening");
    Session::new(Box::new(link), config)
}

/// Resolve a device name or serial, then connect. An unknown name fails with
/// [`MokuError::NotFound`].
pub fn connect_by_name(
    resolver: &dyn AddressResolver,
    name: &str,
    link: LinkConfig,
    config: SessionConfig,
) -> Result<Session> {
    let addr = resolver.resolve(name)?;
    connect_with(addr, link, config)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use mokulink_transport::StaticResolver;

    use super::*;

    #[test]
    fn unknown_device_name_is_not_found() {
        let resolver = StaticResolver::new().with_entry("bench", "127.0.0.1:1".parse().unwrap());
        let err = connect_by_name(
            &resolver,
            "lab-moku",
            LinkConfig::default(),
            SessionConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MokuError::NotFound(ref n) if n == "lab-moku"));
    }

    #[test]
    fn refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect(addr, SessionConfig::default()).err().unwrap();
        assert!(matches!(err, MokuError::Network(_)));
    }

    #[test]
    fn connect_opens_a_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || listener.accept().unwrap());

        let session = connect(addr, SessionConfig::default()).unwrap();
        assert_eq!(session.instrument_name(), None);
        assert_eq!(session.current_epoch(), 0);
        let _peer = server.join().unwrap();
    }
}
