//! Device link transport abstraction.
//!
//! This is the lowest layer of mokulink. It provides:
//! - [`DeviceStream`], a blocking byte stream to the instrument (TCP)
//! - [`TcpConnector`], which opens those streams
//! - [`Transport`], the abstract request/response and streaming contract every
//!   higher layer depends on
//! - [`AddressResolver`], the collaborator that turns a device name or serial
//!   into a socket address
//!
//! The [`mock`] module provides a scriptable [`Transport`] for tests.

pub mod error;
pub mod mock;
pub mod resolve;
pub mod stream;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use resolve::{AddressResolver, StaticResolver};
pub use stream::DeviceStream;
pub use tcp::TcpConnector;
pub use traits::{
    DatalogCommand, DatalogSettings, DatalogState, DatalogStatus, DatalogStorage,
    FramePayload, RegisterTransaction, RegisterWord, Transport,
};
