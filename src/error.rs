//! Fatal errors.
//!
//! Anything in here ends the process. Failures that only concern a single
//! client never become a `RelayError`; they are resolved by closing that
//! client (see `runtime::relay::CloseReason`).

use crate::config::ConfigError;
use std::io;

/// Unrecoverable setup or listener failure.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid listen address '{addr}': {reason}")]
    Address { addr: String, reason: String },

    #[error("socket() failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind() failed: {0}")]
    Bind(#[source] io::Error),

    #[error("listen() failed: {0}")]
    Listen(#[source] io::Error),

    #[error("reactor creation failed: {0}")]
    Reactor(#[source] io::Error),

    #[error("registering the listener failed: {0}")]
    RegisterListener(#[source] io::Error),

    #[error("accept() failed: {0}")]
    Accept(#[source] io::Error),

    #[error("event dispatch failed: {0}")]
    Dispatch(#[source] io::Error),
}

impl RelayError {
    /// OS error code of the underlying failure, if there is one.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            RelayError::Socket(e)
            | RelayError::Bind(e)
            | RelayError::Listen(e)
            | RelayError::Reactor(e)
            | RelayError::RegisterListener(e)
            | RelayError::Accept(e)
            | RelayError::Dispatch(e) => e.raw_os_error(),
            RelayError::Config(_) | RelayError::Address { .. } => None,
        }
    }
}
