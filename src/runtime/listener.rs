//! TCP listener with an interruptible accept.
//!
//! The socket is non-blocking and watched by a `mio::Poll`. A `mio::Waker`
//! on the same poll lets the shutdown path break a pending accept without
//! a timeout.

use crate::shutdown::Shutdown;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Pause between attempts while accept keeps failing.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bound listening socket plus the poller used to wait on it.
pub struct Listener {
    socket: TcpListener,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Resolve `addr`, bind and listen. Any failure here is fatal to startup.
    pub fn bind(addr: &str, backlog: i32) -> io::Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("listen address '{addr}' did not resolve"),
            )
        })?;

        let socket = create_listener(addr, backlog)?;
        let local_addr = socket.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        debug!(addr = %local_addr, backlog, "Bound listener");

        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(8),
            waker,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waker that interrupts a blocked `accept`.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Block until a client connects or `shutdown` is triggered.
    ///
    /// Returns `Ok(None)` on shutdown. Failed accepts are logged and retried;
    /// only a failure of the poller itself is returned as an error.
    pub fn accept(&mut self, shutdown: &Shutdown) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            if shutdown.is_triggered() {
                return Ok(None);
            }

            let timeout = match self.socket.accept() {
                Ok((stream, peer)) => {
                    // Accepted sockets inherit O_NONBLOCK on some platforms
                    match stream.set_nonblocking(false) {
                        Ok(()) => return Ok(Some((stream, peer))),
                        Err(e) => {
                            warn!(%peer, error = %e, "Failed to configure accepted connection");
                            continue;
                        }
                    }
                }
                Err(e) => match accept_retry(&e) {
                    Retry::Immediately => continue,
                    Retry::WhenReady => None,
                    Retry::After(delay) => {
                        warn!(error = %e, "Failed to accept connection");
                        Some(delay)
                    }
                },
            };

            // The waker still interrupts a backoff wait
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// How the accept loop proceeds after `accept(2)` fails.
#[derive(Debug, PartialEq, Eq)]
enum Retry {
    Immediately,
    WhenReady,
    After(Duration),
}

fn accept_retry(e: &io::Error) -> Retry {
    match e.kind() {
        io::ErrorKind::WouldBlock => Retry::WhenReady,
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => Retry::Immediately,
        // EMFILE, ENFILE, ENOBUFS and the like persist until something is
        // released, and the pending connection raises no new readiness event
        _ => Retry::After(ACCEPT_RETRY_DELAY),
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts don't wait out TIME_WAIT.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
