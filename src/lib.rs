//! line-relay: a single-threaded TCP line relay.
//!
//! Clients connect and send `\n`-terminated lines (an optional `\r` before
//! the terminator is stripped). Every line is rebroadcast, terminated by a
//! single `\n`, to all other connected clients. A client whose outbound
//! buffer cannot absorb a line is disconnected instead of being buffered
//! without bound.

pub mod config;
pub mod error;
pub mod runtime;

pub use config::Config;
pub use error::RelayError;
pub use runtime::{Server, ShutdownHandle};
