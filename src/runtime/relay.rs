//! Connection lifecycle and line fanout.
//!
//! `Relay` owns every connection, both buffer pools and the readiness
//! registrations. All of it is driven from a single reactor thread, so a
//! line received on one connection is copied straight into the write buffers
//! of all the others without any locking.
//!
//! ## Backpressure
//!
//! A peer whose write buffer cannot take a whole line plus its delimiter is
//! disconnected on the spot. The line is never truncated and the sender is
//! never blocked; the remaining peers still receive it.
//!
//! ## Teardown
//!
//! Every way a connection can end goes through `Relay::close`, which drops
//! readiness interest, unlinks the connection, returns its buffers to the
//! pools and closes the socket in one step.

use crate::config::Config;
use crate::runtime::buffer::{BufferPool, Overflow};
use crate::runtime::connection::Connection;
use crate::runtime::readiness::Readiness;
use crate::runtime::registry::ConnectionRegistry;
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Buffers allocated up front per pool; the rest are allocated on demand.
const PREALLOCATED_BUFFERS: usize = 64;

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed its end.
    PeerClosed,
    /// Reading from the socket failed.
    ReadFailed(io::ErrorKind),
    /// Writing to the socket failed.
    WriteFailed(io::ErrorKind),
    /// The read buffer filled up without a line terminator.
    LineTooLong,
    /// A relayed line did not fit into the write buffer.
    SlowConsumer(Overflow),
    /// Readiness interest could not be updated.
    Registration(io::ErrorKind),
    /// The relay is shutting down.
    Shutdown,
}

/// Single-threaded line relay state.
pub struct Relay<S, R> {
    connections: ConnectionRegistry<Connection<S>>,
    read_pool: BufferPool,
    write_pool: BufferPool,
    readiness: R,
    max_connections: usize,
}

impl<S: Read + Write, R: Readiness<S>> Relay<S, R> {
    pub fn new(config: &Config, readiness: R) -> Self {
        let max_connections = config.max_connections;
        let prealloc = max_connections.min(PREALLOCATED_BUFFERS);

        Self {
            connections: ConnectionRegistry::with_capacity(max_connections.min(1024)),
            read_pool: BufferPool::new(prealloc, max_connections, config.read_buffer_size),
            write_pool: BufferPool::new(prealloc, max_connections, config.write_buffer_size()),
            readiness,
            max_connections,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, key: usize) -> bool {
        self.connections.contains(key)
    }

    pub fn connection(&self, key: usize) -> Option<&Connection<S>> {
        self.connections.get(key)
    }

    pub fn readiness(&self) -> &R {
        &self.readiness
    }

    /// Take ownership of a freshly accepted stream.
    ///
    /// The stream must already be non-blocking. Returns the connection key,
    /// or `None` if the stream was turned away (and dropped, closing it).
    pub fn admit(&mut self, stream: S, peer: Option<SocketAddr>) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            warn!(peer = ?peer, max = self.max_connections, "Connection limit reached");
            return None;
        }

        let Some(read_buf) = self.read_pool.alloc() else {
            warn!(peer = ?peer, "Read buffer pool exhausted, rejecting connection");
            return None;
        };
        let Some(write_buf) = self.write_pool.alloc() else {
            warn!(peer = ?peer, "Write buffer pool exhausted, rejecting connection");
            self.read_pool.free(read_buf);
            return None;
        };

        let key = self
            .connections
            .insert(Connection::new(stream, peer, read_buf, write_buf));

        let conn = self.connections.get_mut(key)?;
        if let Err(e) = self.readiness.register(&mut conn.stream, key) {
            self.close(key, CloseReason::Registration(e.kind()));
            return None;
        }

        debug!(conn_id = key, peer = ?peer, "New connection");
        Some(key)
    }

    /// Drain a readable socket and relay every complete line it delivered.
    pub fn on_readable(&mut self, key: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return;
            };

            let n = loop {
                match conn.read.fill_from(&mut conn.stream) {
                    Ok(0) => {
                        self.close(key, CloseReason::PeerClosed);
                        return;
                    }
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        self.close(key, CloseReason::ReadFailed(e.kind()));
                        return;
                    }
                }
            };
            trace!(conn_id = key, bytes = n, "Read");

            // The buffer is moved out so peers' buffers can be written while
            // the lines are still borrowed from it.
            let mut read = mem::take(&mut conn.read);
            read.drain_lines(|line| self.deliver(key, line));
            let too_long = read.is_full();

            match self.connections.get_mut(key) {
                Some(conn) => conn.read = read,
                None => {
                    self.read_pool.free(read.into_inner());
                    return;
                }
            }

            if too_long {
                self.close(key, CloseReason::LineTooLong);
                return;
            }
        }
    }

    /// Flush as much queued output as the socket accepts.
    pub fn on_writable(&mut self, key: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return;
            };
            if conn.write.is_empty() {
                break;
            }

            match conn.stream.write(conn.write.pending()) {
                Ok(0) => {
                    self.close(key, CloseReason::WriteFailed(io::ErrorKind::WriteZero));
                    return;
                }
                Ok(n) => {
                    trace!(conn_id = key, bytes = n, "Wrote");
                    conn.write.consume(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.close(key, CloseReason::WriteFailed(e.kind()));
                    return;
                }
            }
        }

        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        if conn.write_interest {
            if let Err(e) = self.readiness.set_writable(&mut conn.stream, key, false) {
                self.close(key, CloseReason::Registration(e.kind()));
                return;
            }
            conn.write_interest = false;
            trace!(conn_id = key, "Write buffer empty, dropped write interest");
        }
    }

    /// Queue `line` on every connection except `sender`.
    fn deliver(&mut self, sender: usize, line: &[u8]) {
        debug!(conn_id = sender, len = line.len(), "Relaying line");

        let mut peers = self.connections.peers_of(sender);
        while let Some(peer) = peers.next(&self.connections) {
            let Some(conn) = self.connections.get_mut(peer) else {
                continue;
            };

            if let Err(overflow) = conn.write.push_line(line) {
                self.close(peer, CloseReason::SlowConsumer(overflow));
                continue;
            }

            if !conn.write_interest {
                if let Err(e) = self.readiness.set_writable(&mut conn.stream, peer, true) {
                    self.close(peer, CloseReason::Registration(e.kind()));
                    continue;
                }
                conn.write_interest = true;
            }
        }
    }

    /// Tear a connection down completely. Unknown keys are ignored.
    pub fn close(&mut self, key: usize, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(key) else {
            return;
        };

        if let Err(e) = self.readiness.deregister(&mut conn.stream) {
            debug!(conn_id = key, error = %e, "Deregister failed");
        }

        let Connection {
            stream,
            peer,
            read,
            write,
            ..
        } = conn;
        self.read_pool.free(read.into_inner());
        self.write_pool.free(write.into_inner());
        drop(stream);

        match reason {
            CloseReason::SlowConsumer(Overflow { needed, available }) => {
                warn!(
                    conn_id = key,
                    peer = ?peer,
                    needed,
                    available,
                    "Peer too slow, closing connection"
                );
            }
            _ => debug!(conn_id = key, peer = ?peer, reason = ?reason, "Connection closed"),
        }
    }

    /// Tear down every connection.
    pub fn close_all(&mut self) {
        for key in self.connections.keys() {
            self.close(key, CloseReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;

    #[derive(Default)]
    struct Script {
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: VecDeque<io::Result<usize>>,
        written: Vec<u8>,
    }

    /// In-memory stream with scripted read and write outcomes.
    ///
    /// Reads past the end of the script would block; writes without a
    /// scripted outcome accept everything.
    #[derive(Clone, Default)]
    struct MockStream(Rc<RefCell<Script>>);

    impl MockStream {
        fn send(&self, data: &[u8]) {
            self.0.borrow_mut().reads.push_back(Ok(data.to_vec()));
        }

        fn hang_up(&self) {
            self.0.borrow_mut().reads.push_back(Ok(Vec::new()));
        }

        fn fail_read(&self, kind: io::ErrorKind) {
            self.0.borrow_mut().reads.push_back(Err(kind.into()));
        }

        fn accept_bytes(&self, n: usize) {
            self.0.borrow_mut().writes.push_back(Ok(n));
        }

        fn fail_write(&self, kind: io::ErrorKind) {
            self.0.borrow_mut().writes.push_back(Err(kind.into()));
        }

        fn received(&self) -> Vec<u8> {
            self.0.borrow().written.clone()
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut script = self.0.borrow_mut();
            match script.reads.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        script.reads.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut script = self.0.borrow_mut();
            let n = match script.writes.pop_front() {
                None => buf.len(),
                Some(Ok(max)) => max.min(buf.len()),
                Some(Err(e)) => return Err(e),
            };
            script.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockReadiness {
        registered: Vec<usize>,
        writable: HashMap<usize, bool>,
        writable_calls: usize,
        deregistered: usize,
        fail_writable: bool,
    }

    impl Readiness<MockStream> for MockReadiness {
        fn register(&mut self, _stream: &mut MockStream, key: usize) -> io::Result<()> {
            self.registered.push(key);
            Ok(())
        }

        fn set_writable(
            &mut self,
            _stream: &mut MockStream,
            key: usize,
            writable: bool,
        ) -> io::Result<()> {
            if self.fail_writable {
                return Err(io::ErrorKind::Other.into());
            }
            self.writable_calls += 1;
            self.writable.insert(key, writable);
            Ok(())
        }

        fn deregister(&mut self, _stream: &mut MockStream) -> io::Result<()> {
            self.deregistered += 1;
            Ok(())
        }
    }

    type TestRelay = Relay<MockStream, MockReadiness>;

    fn relay_with(read_buffer_size: usize, max_connections: usize) -> TestRelay {
        let mut config = Config::new("127.0.0.1", 0);
        config.read_buffer_size = read_buffer_size;
        config.max_connections = max_connections;
        Relay::new(&config, MockReadiness::default())
    }

    fn connect(relay: &mut TestRelay) -> (usize, MockStream) {
        let stream = MockStream::default();
        let key = relay.admit(stream.clone(), None).unwrap();
        (key, stream)
    }

    fn pending(relay: &TestRelay, key: usize) -> Vec<u8> {
        relay.connection(key).unwrap().write.pending().to_vec()
    }

    fn wants_write(relay: &TestRelay, key: usize) -> bool {
        relay.readiness().writable.get(&key).copied().unwrap_or(false)
    }

    #[test]
    fn test_line_goes_to_peer_not_sender() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, stream_b) = connect(&mut relay);

        stream_a.send(b"hi\n");
        relay.on_readable(a);

        assert_eq!(pending(&relay, b), b"hi\n");
        assert_eq!(pending(&relay, a), b"");
        assert!(wants_write(&relay, b));
        assert!(!wants_write(&relay, a));

        relay.on_writable(b);
        assert_eq!(stream_b.received(), b"hi\n");
        assert_eq!(stream_a.received(), b"");
        assert!(!wants_write(&relay, b));
        assert!(!relay.connection(b).unwrap().write_interest);
    }

    #[test]
    fn test_every_other_peer_receives() {
        let mut relay = relay_with(128, 16);
        let peers: Vec<(usize, MockStream)> = (0..5).map(|_| connect(&mut relay)).collect();
        let (sender, stream) = &peers[2];

        stream.send(b"hello\n");
        relay.on_readable(*sender);

        for (key, _) in &peers {
            let expected: &[u8] = if key == sender { b"" } else { b"hello\n" };
            assert_eq!(pending(&relay, *key), expected);
        }
    }

    #[test]
    fn test_two_lines_in_one_chunk_keep_order() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.send(b"a\nb\n");
        relay.on_readable(a);

        assert_eq!(pending(&relay, b), b"a\nb\n");
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.send(b"Hello!");
        relay.on_readable(a);
        assert_eq!(pending(&relay, b), b"");

        stream_a.send(b"\r\n");
        relay.on_readable(a);
        assert_eq!(pending(&relay, b), b"Hello!\n");
    }

    #[test]
    fn test_fragment_then_eof_is_dropped() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.send(b"x");
        stream_a.hang_up();
        relay.on_readable(a);

        assert!(!relay.contains(a));
        assert!(relay.contains(b));
        assert_eq!(pending(&relay, b), b"");
        assert_eq!(relay.readiness().deregistered, 1);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.fail_read(io::ErrorKind::Interrupted);
        stream_a.send(b"again\n");
        relay.on_readable(a);

        assert!(relay.contains(a));
        assert_eq!(pending(&relay, b), b"again\n");
    }

    #[test]
    fn test_read_error_closes_connection() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.fail_read(io::ErrorKind::ConnectionReset);
        relay.on_readable(a);

        assert!(!relay.contains(a));
        assert!(relay.contains(b));
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn test_oversized_line_closes_only_sender() {
        let mut relay = relay_with(8, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.send(b"abcdefgh");
        relay.on_readable(a);

        assert!(!relay.contains(a));
        assert!(relay.contains(b));
        assert_eq!(pending(&relay, b), b"");
    }

    #[test]
    fn test_longest_line_fits() {
        let mut relay = relay_with(8, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        // Seven payload bytes plus terminator fill the read buffer exactly
        stream_a.send(b"abcdefg\n");
        relay.on_readable(a);

        assert!(relay.contains(a));
        assert_eq!(pending(&relay, b), b"abcdefg\n");
    }

    #[test]
    fn test_slow_consumer_disconnected_at_boundary() {
        // Write buffers hold 64 bytes: eight "abcdefg\n" lines exactly.
        let mut relay = relay_with(8, 16);
        let (a, stream_a) = connect(&mut relay);
        let (slow, _) = connect(&mut relay);
        let (fast, stream_fast) = connect(&mut relay);

        for _ in 0..8 {
            stream_a.send(b"abcdefg\n");
            relay.on_readable(a);
            relay.on_writable(fast);
        }
        assert!(relay.contains(slow));
        assert_eq!(relay.connection(slow).unwrap().write.used(), 64);

        stream_a.send(b"abcdefg\n");
        relay.on_readable(a);
        relay.on_writable(fast);

        assert!(!relay.contains(slow));
        assert!(relay.contains(a));
        assert_eq!(stream_fast.received(), b"abcdefg\n".repeat(9));
    }

    #[test]
    fn test_write_interest_registered_once() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        stream_a.send(b"one\n");
        relay.on_readable(a);
        stream_a.send(b"two\n");
        relay.on_readable(a);

        assert_eq!(relay.readiness().writable_calls, 1);
        assert_eq!(pending(&relay, b), b"one\ntwo\n");
    }

    #[test]
    fn test_partial_write_keeps_remainder() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, stream_b) = connect(&mut relay);

        stream_a.send(b"hello\n");
        relay.on_readable(a);

        stream_b.accept_bytes(2);
        stream_b.fail_write(io::ErrorKind::WouldBlock);
        relay.on_writable(b);

        assert_eq!(stream_b.received(), b"he");
        assert_eq!(pending(&relay, b), b"llo\n");
        assert!(wants_write(&relay, b));

        relay.on_writable(b);
        assert_eq!(stream_b.received(), b"hello\n");
        assert!(!wants_write(&relay, b));
    }

    #[test]
    fn test_interrupted_write_is_retried() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, stream_b) = connect(&mut relay);

        stream_a.send(b"hi\n");
        relay.on_readable(a);

        stream_b.fail_write(io::ErrorKind::Interrupted);
        relay.on_writable(b);

        assert!(relay.contains(b));
        assert_eq!(stream_b.received(), b"hi\n");
    }

    #[test]
    fn test_write_error_closes_connection() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, stream_b) = connect(&mut relay);

        stream_a.send(b"hi\n");
        relay.on_readable(a);

        stream_b.fail_write(io::ErrorKind::BrokenPipe);
        relay.on_writable(b);

        assert!(!relay.contains(b));
        assert!(relay.contains(a));
    }

    #[test]
    fn test_zero_length_write_closes_connection() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, stream_b) = connect(&mut relay);

        stream_a.send(b"hi\n");
        relay.on_readable(a);

        stream_b.accept_bytes(0);
        relay.on_writable(b);

        assert!(!relay.contains(b));
    }

    #[test]
    fn test_failed_write_registration_closes_peer() {
        let mut relay = relay_with(128, 16);
        let (a, stream_a) = connect(&mut relay);
        let (b, _) = connect(&mut relay);

        relay.readiness.fail_writable = true;
        stream_a.send(b"hi\n");
        relay.on_readable(a);

        assert!(!relay.contains(b));
        assert!(relay.contains(a));
    }

    #[test]
    fn test_connection_limit() {
        let mut relay = relay_with(128, 2);
        connect(&mut relay);
        connect(&mut relay);

        assert!(relay.admit(MockStream::default(), None).is_none());
        assert_eq!(relay.len(), 2);
    }

    #[test]
    fn test_close_returns_buffers() {
        let mut relay = relay_with(128, 4);
        let (a, _) = connect(&mut relay);
        connect(&mut relay);
        assert_eq!(relay.read_pool.available(), 2);
        assert_eq!(relay.write_pool.available(), 2);

        relay.close(a, CloseReason::PeerClosed);
        relay.close(a, CloseReason::PeerClosed);
        assert_eq!(relay.read_pool.available(), 3);

        relay.close_all();
        assert!(relay.is_empty());
        assert_eq!(relay.read_pool.available(), 4);
        assert_eq!(relay.write_pool.available(), 4);
        assert_eq!(relay.readiness().deregistered, 2);
    }

    #[test]
    fn test_new_connection_has_clean_buffers() {
        let mut relay = relay_with(8, 4);
        let (a, stream_a) = connect(&mut relay);
        stream_a.send(b"dirty");
        relay.on_readable(a);
        relay.close(a, CloseReason::PeerClosed);

        let (b, _) = connect(&mut relay);
        let conn = relay.connection(b).unwrap();
        assert_eq!(conn.read.used(), 0);
        assert!(conn.write.is_empty());
        assert!(!conn.write_interest);
        assert_eq!(relay.readiness().registered.len(), 2);
    }
}
