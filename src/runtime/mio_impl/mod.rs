//! mio-based reactor.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! One thread owns the poll instance, the listener and every connection.

mod event_loop;

pub use event_loop::{Server, ShutdownHandle};

use crate::config::Config;
use crate::error::RelayError;

/// Bind and serve until the relay is shut down.
pub fn run(config: Config) -> Result<(), RelayError> {
    Server::bind(&config)?.run()
}
