//! Per-client connection state.

use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use std::net::SocketAddr;

/// A single client connection.
///
/// Generic over the stream so the pipelines can run against anything that
/// reads and writes without blocking.
#[derive(Debug)]
pub struct Connection<S> {
    /// Non-blocking socket.
    pub stream: S,
    /// Remote address, if known.
    pub peer: Option<SocketAddr>,
    /// Bytes of the line currently being received.
    pub read: ReadBuffer,
    /// Lines queued for this client.
    pub write: WriteBuffer,
    /// Whether the reactor is currently watching for writability.
    /// Only true while `write` holds pending bytes.
    pub write_interest: bool,
}

impl<S> Connection<S> {
    /// Create a connection with empty buffers, interested in reads only.
    pub fn new(stream: S, peer: Option<SocketAddr>, read: Box<[u8]>, write: Box<[u8]>) -> Self {
        Self {
            stream,
            peer,
            read: ReadBuffer::new(read),
            write: WriteBuffer::new(write),
            write_interest: false,
        }
    }
}
