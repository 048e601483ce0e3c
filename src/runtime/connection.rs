//! Connection worker state machine.
//!
//! Each accepted socket gets its own thread running a `Worker`:
//!
//! ```text
//! Receiving -> Appending -> Replying -> Done
//!     |  ^          |
//!     +--+          +-- (any failure) --> Done
//! ```
//!
//! The packet is buffered in memory until its terminator arrives, appended
//! to the log in one write, and then the whole log (as of that moment) is
//! streamed back. A connection that fails before the packet completes
//! leaves the log untouched and gets no reply.

use crate::log_store::LogStore;
use crate::protocol::{self, Frame};
use crate::shutdown::Shutdown;
use bytes::BytesMut;
use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Receive limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnLimits {
    /// Bytes requested per socket read.
    pub chunk_size: usize,
    /// Packets growing past this are rejected.
    pub max_packet_size: usize,
    /// Read timeout used to re-check the shutdown token.
    pub recv_poll: Duration,
}

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Waiting for packet bytes.
    Receiving,
    /// Packet complete, writing it to the log.
    Appending,
    /// Streaming the log back to the client.
    Replying {
        /// Log size captured after the append.
        len: u64,
    },
    /// Finished, successfully or not.
    Done(ConnOutcome),
}

/// Why a connection ended without a reply being fully sent.
#[derive(Debug)]
pub enum ConnError {
    /// Peer closed before sending a terminator.
    PeerClosed { received: usize },
    /// Shutdown began while the packet was still incomplete.
    ShutdownWhileReceiving { received: usize },
    /// Packet grew past the configured limit.
    PacketTooLarge { limit: usize },
    Receive(io::Error),
    LogWrite(io::Error),
    LogRead(io::Error),
    Send(io::Error),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::PeerClosed { received } => {
                write!(f, "peer closed with incomplete packet ({received} bytes)")
            }
            ConnError::ShutdownWhileReceiving { received } => {
                write!(f, "shutdown with incomplete packet ({received} bytes)")
            }
            ConnError::PacketTooLarge { limit } => {
                write!(f, "packet exceeds {limit} bytes")
            }
            ConnError::Receive(e) => write!(f, "receive failed: {e}"),
            ConnError::LogWrite(e) => write!(f, "packet log append failed: {e}"),
            ConnError::LogRead(e) => write!(f, "packet log read failed: {e}"),
            ConnError::Send(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Receive(e)
            | ConnError::LogWrite(e)
            | ConnError::LogRead(e)
            | ConnError::Send(e) => Some(e),
            _ => None,
        }
    }
}

/// Final result of a connection, handed back through the join handle.
#[derive(Debug)]
pub enum ConnOutcome {
    Replied { packet: usize, reply: u64 },
    Abandoned(ConnError),
}

/// One accepted socket and the flag its worker raises on exit.
#[derive(Debug)]
pub struct ConnectionTask {
    pub id: usize,
    pub peer: SocketAddr,
    stream: TcpStream,
    completion: Arc<AtomicBool>,
}

impl ConnectionTask {
    pub fn new(id: usize, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            stream,
            completion: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared completion flag, observed by the registry.
    pub fn completion(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.completion)
    }
}

/// Sets the completion flag when dropped, including on panic.
struct CompletionGuard(Arc<AtomicBool>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Handles one connection from first byte to close.
pub struct Worker {
    task: ConnectionTask,
    store: Arc<LogStore>,
    shutdown: Shutdown,
    limits: ConnLimits,
    packet: BytesMut,
}

impl Worker {
    pub fn new(
        task: ConnectionTask,
        store: Arc<LogStore>,
        shutdown: Shutdown,
        limits: ConnLimits,
    ) -> Self {
        Self {
            task,
            store,
            shutdown,
            limits,
            packet: BytesMut::with_capacity(limits.chunk_size),
        }
    }

    /// Drive the connection to completion. Consumes the worker, so the
    /// socket is closed before the completion flag is raised.
    pub fn run(self) -> ConnOutcome {
        let _done = CompletionGuard(self.task.completion());
        let id = self.task.id;
        let peer = self.task.peer;

        let outcome = self.serve();
        info!(id, %peer, "Closed connection");
        outcome
    }

    fn serve(mut self) -> ConnOutcome {
        if let Err(e) = self.task.stream.set_read_timeout(Some(self.limits.recv_poll)) {
            return ConnOutcome::Abandoned(ConnError::Receive(e));
        }

        let mut chunk = vec![0u8; self.limits.chunk_size];
        let mut state = ConnState::Receiving;

        loop {
            trace!(id = self.task.id, ?state, "Connection state");
            state = match state {
                ConnState::Receiving => match self.receive(&mut chunk) {
                    Ok(true) => ConnState::Appending,
                    Ok(false) => ConnState::Receiving,
                    Err(e) => ConnState::Done(ConnOutcome::Abandoned(e)),
                },
                ConnState::Appending => match self.append() {
                    Ok(len) => ConnState::Replying { len },
                    Err(e) => ConnState::Done(ConnOutcome::Abandoned(e)),
                },
                ConnState::Replying { len } => {
                    match self.store.stream_to(&mut self.task.stream, len) {
                        Ok(reply) => ConnState::Done(ConnOutcome::Replied {
                            packet: self.packet.len(),
                            reply,
                        }),
                        Err(e) => ConnState::Done(ConnOutcome::Abandoned(classify_send_error(e))),
                    }
                }
                ConnState::Done(outcome) => return outcome,
            };
        }
    }

    /// Append the finished packet and snapshot the log size for the reply.
    fn append(&self) -> Result<u64, ConnError> {
        self.store.append(&self.packet).map_err(ConnError::LogWrite)?;
        self.store.snapshot_len().map_err(ConnError::LogRead)
    }

    /// Read one chunk into the packet buffer.
    ///
    /// Returns `Ok(true)` once the terminator has been seen.
    fn receive(&mut self, chunk: &mut [u8]) -> Result<bool, ConnError> {
        let n = loop {
            match self.task.stream.read(chunk) {
                Ok(n) => break n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if self.shutdown.is_triggered() {
                        return Err(ConnError::ShutdownWhileReceiving {
                            received: self.packet.len(),
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ConnError::Receive(e)),
            }
        };

        if n == 0 {
            return Err(ConnError::PeerClosed {
                received: self.packet.len(),
            });
        }

        let (take, complete) = match protocol::scan(&chunk[..n]) {
            Frame::Partial => (n, false),
            Frame::Complete { len, trailing } => {
                if trailing > 0 {
                    debug!(
                        id = self.task.id,
                        bytes = trailing,
                        "Discarding bytes after packet terminator"
                    );
                }
                (len, true)
            }
        };

        if self.packet.len() + take > self.limits.max_packet_size {
            return Err(ConnError::PacketTooLarge {
                limit: self.limits.max_packet_size,
            });
        }
        self.packet.extend_from_slice(&chunk[..take]);
        Ok(complete)
    }
}

/// `stream_to` mixes file and socket errors; a missing or short log is a
/// read error, anything else came from the socket.
fn classify_send_error(e: io::Error) -> ConnError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::NotFound => ConnError::LogRead(e),
        _ => ConnError::Send(e),
    }
}
