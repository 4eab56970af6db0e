//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//!
//! mio notifications are edge-triggered, so each readiness event is handled
//! by draining the socket until it would block (see `Relay::on_readable` and
//! `Relay::on_writable`). The listener is drained the same way.

use crate::config::Config;
use crate::error::RelayError;
use crate::runtime::relay::Relay;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// A bound relay, ready to run.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    relay: Relay<TcpStream, Registry>,
    shutdown: ShutdownHandle,
}

/// Stops a running `Server` from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the event loop to close every connection and return.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl Server {
    /// Create the listening socket and the reactor.
    pub fn bind(config: &Config) -> Result<Self, RelayError> {
        let addr = resolve(&config.host, config.port)?;
        let listener = create_listener(addr, config.backlog)?;

        let poll = Poll::new().map_err(RelayError::Reactor)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(RelayError::RegisterListener)?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(RelayError::Reactor)?;
        let registry = poll.registry().try_clone().map_err(RelayError::Reactor)?;

        Ok(Server {
            events: Events::with_capacity(config.events_capacity),
            relay: Relay::new(config, registry),
            shutdown: ShutdownHandle {
                requested: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            poll,
            listener,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Dispatch readiness events until shut down.
    pub fn run(self) -> Result<(), RelayError> {
        let Server {
            mut poll,
            mut events,
            listener,
            mut relay,
            shutdown,
        } = self;

        info!(addr = ?listener.local_addr().ok(), "Relay listening");

        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RelayError::Dispatch(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_connections(&listener, &mut relay)?,
                    WAKER_TOKEN => {}
                    Token(conn_id) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            relay.on_readable(conn_id);
                        }

                        // Re-check connection exists (may have been closed)
                        if relay.contains(conn_id)
                            && (event.is_writable() || event.is_write_closed())
                        {
                            relay.on_writable(conn_id);
                        }
                    }
                }
            }

            if shutdown.is_requested() {
                break;
            }
        }

        let open = relay.len();
        relay.close_all();
        info!(closed = open, "Relay stopped");
        Ok(())
    }
}

/// Accept every pending connection.
///
/// Only a broken listener is fatal; a client that vanished before we got to
/// it is skipped.
fn accept_connections(
    listener: &TcpListener,
    relay: &mut Relay<TcpStream, Registry>,
) -> Result<(), RelayError> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                relay.admit(stream, Some(peer));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(error = %e, "Client went away before accept");
            }
            Err(e) => return Err(RelayError::Accept(e)),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    let ip: IpAddr = host.parse().map_err(|e: std::net::AddrParseError| RelayError::Address {
        addr: host.to_string(),
        reason: e.to_string(),
    })?;
    Ok(SocketAddr::new(ip, port))
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, RelayError> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(RelayError::Socket)?;

    socket.set_reuse_address(true).map_err(RelayError::Socket)?;
    socket.set_nonblocking(true).map_err(RelayError::Socket)?;
    socket.bind(&addr.into()).map_err(RelayError::Bind)?;
    socket.listen(backlog).map_err(RelayError::Listen)?;

    Ok(socket.into())
}
