//! Readiness interest management.
//!
//! The relay only needs three things from the reactor: start watching a new
//! stream for reads, toggle write interest on top of that, and forget a
//! stream before it is closed. The mio `Registry` provides all three; tests
//! substitute a recording implementation.

use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::io;

/// Per-stream readiness registration, keyed by connection id.
pub trait Readiness<S> {
    /// Start watching `stream` for readability.
    fn register(&mut self, stream: &mut S, key: usize) -> io::Result<()>;

    /// Watch `stream` for readability, plus writability if `writable`.
    fn set_writable(&mut self, stream: &mut S, key: usize, writable: bool) -> io::Result<()>;

    /// Stop watching `stream` entirely.
    fn deregister(&mut self, stream: &mut S) -> io::Result<()>;
}

impl<S: Source> Readiness<S> for Registry {
    fn register(&mut self, stream: &mut S, key: usize) -> io::Result<()> {
        Registry::register(self, stream, Token(key), Interest::READABLE)
    }

    fn set_writable(&mut self, stream: &mut S, key: usize, writable: bool) -> io::Result<()> {
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        Registry::reregister(self, stream, Token(key), interest)
    }

    fn deregister(&mut self, stream: &mut S) -> io::Result<()> {
        Registry::deregister(self, stream)
    }
}
