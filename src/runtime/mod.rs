//! Single-threaded relay runtime.
//!
//! - `Relay`: connection lifecycle, read/write pipelines and line fanout
//! - `ConnectionRegistry`: ring of live connections with O(1) insert/remove
//! - `BufferPool`, `ReadBuffer`, `WriteBuffer`: fixed-capacity buffers
//! - `Readiness`: the slice of the reactor the relay depends on
//! - `mio_impl`: the mio reactor that accepts clients and dispatches events

pub mod buffer;
pub mod connection;
mod mio_impl;
pub mod readiness;
pub mod registry;
pub mod relay;

pub use mio_impl::{Server, ShutdownHandle};
pub use readiness::Readiness;
pub use relay::{CloseReason, Relay};

use crate::config::Config;
use crate::error::RelayError;

/// Run the relay until it is shut down or a fatal error occurs.
pub fn run(config: Config) -> Result<(), RelayError> {
    mio_impl::run(config)
}
