//! Non-blocking connection handler for the reactor transport.
//!
//! The reactor thread owns the socket and calls [`NonBlockingHandler::
//! continue_read`] and [`NonBlockingHandler::continue_write`] on readiness.
//! Decoding and protocol processing run on the worker pool through
//! [`NonBlockingHandler::decode`], keyed by connection id so one connection's
//! frames are always processed in order.
//!
//! At most [`MAX_CHUNKS_IN_FLIGHT`] chunks per connection are read but not
//! yet decoded. A connection that hits the limit stops being read, leaving
//! the rest in the kernel so TCP flow control pushes back on the client. The
//! decode task that brings it back under the limit asks the reactor to resume
//! reading.
//!
//! Outbound frames from any thread are encoded into the handler's queue and
//! the reactor is asked to watch for writability; the reactor flushes the
//! queue when the socket is writable. The connection's final frame is held
//! back until the handle is closed, which the registry does only after it has
//! forgotten the connection.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytes::{Buf, Bytes};
use mio::{Interest, net::TcpStream};
use parking_lot::Mutex;
use stompd_proto::{Frame, FrameCodec};

use crate::{
    audit::AuditLog,
    buffer_pool::{BufferPool, LeasedBuffer},
    driver::ProtocolDriver,
    reactor::{ReactorHandle, ReactorTask},
    registry::{ConnectionHandle, ConnectionId, ConnectionRegistry},
};

/// Read buffers a connection may hold between the socket and its decoder.
pub const MAX_CHUNKS_IN_FLIGHT: usize = 8;

/// Bytes read into one leased buffer.
#[derive(Debug)]
pub struct Chunk {
    buffer: LeasedBuffer,
    len: usize,
}

impl Chunk {
    /// The bytes read.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

/// Result of one readiness-triggered read pass.
#[derive(Debug, Default)]
pub struct ReadPass {
    /// Data read, in order
    pub chunks: Vec<Chunk>,
    /// The peer closed its write side
    pub eof: bool,
}

/// State of the outbound queue after a write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// The socket buffer filled up; keep watching for writability
    Pending,
    /// Everything was written
    Drained,
    /// Everything was written, including the connection's final frame
    Finished,
}

/// Decoder side, only touched by worker-pool tasks for this connection.
struct Inbound {
    codec: FrameCodec,
    driver: ProtocolDriver,
}

/// Outbound queue of encoded frames.
#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    /// Final frame, written once the handle is closed
    last: Option<Bytes>,
    /// Final frame queued; nothing more is accepted
    sealed: bool,
}

/// Per-connection state for the reactor transport.
pub struct NonBlockingHandler {
    id: ConnectionId,
    peer: SocketAddr,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    closed: AtomicBool,
    eof: AtomicBool,
    /// Chunks read and not yet decoded
    in_flight: AtomicUsize,
    /// Reading stopped at the in-flight limit
    stalled: AtomicBool,
    reactor: ReactorHandle,
    registry: Arc<ConnectionRegistry>,
    buffers: Arc<BufferPool>,
}

impl std::fmt::Debug for NonBlockingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingHandler")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NonBlockingHandler {
    /// Create the handler for a freshly accepted connection.
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        reactor: ReactorHandle,
        registry: Arc<ConnectionRegistry>,
        audit: Arc<dyn AuditLog>,
        buffers: Arc<BufferPool>,
    ) -> Self {
        let driver = ProtocolDriver::new(id, Arc::clone(&registry), audit);

        Self {
            id,
            peer,
            inbound: Mutex::new(Inbound { codec: FrameCodec::new(), driver }),
            outbound: Mutex::new(Outbound::default()),
            closed: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            reactor,
            registry,
            buffers,
        }
    }

    /// First task run for a connection on the worker pool.
    pub fn start(&self) {
        tracing::debug!(connection_id = self.id, peer = %self.peer, "connection started");
    }

    /// Read from the socket into leased buffers.
    ///
    /// Runs on the reactor thread. Reads until the socket would block, since
    /// readiness is edge-triggered, or until [`MAX_CHUNKS_IN_FLIGHT`] chunks
    /// are waiting for the decoder. In the latter case reading resumes once a
    /// decode task catches up.
    pub fn continue_read(&self, stream: &mut TcpStream) -> io::Result<ReadPass> {
        let mut pass = ReadPass::default();
        if self.eof.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Ok(pass);
        }

        loop {
            if self.in_flight.load(Ordering::SeqCst) >= MAX_CHUNKS_IN_FLIGHT {
                self.stalled.store(true, Ordering::SeqCst);
                // A decode finishing before the flag was set did not see it.
                if self.in_flight.load(Ordering::SeqCst) >= MAX_CHUNKS_IN_FLIGHT
                    || !self.stalled.swap(false, Ordering::SeqCst)
                {
                    tracing::trace!(connection_id = self.id, "read stalled");
                    return Ok(pass);
                }
            }

            let mut buffer = self.buffers.lease();
            match stream.read(&mut buffer) {
                Ok(0) => {
                    self.eof.store(true, Ordering::SeqCst);
                    pass.eof = true;
                    return Ok(pass);
                },
                Ok(len) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    pass.chunks.push(Chunk { buffer, len });
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(pass),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(err),
            }
        }
    }

    /// Decode chunks and process every complete frame.
    ///
    /// Runs on the worker pool. Each chunk's buffer goes back to the pool as
    /// soon as it has been fed to the codec. Frames after a terminating one
    /// are dropped.
    pub fn decode(&self, chunks: Vec<Chunk>) {
        let count = chunks.len();
        let terminated = {
            let mut inbound = self.inbound.lock();
            let Inbound { codec, driver } = &mut *inbound;

            for chunk in chunks {
                if driver.should_terminate() {
                    break;
                }

                for raw in codec.decode(chunk.bytes()) {
                    driver.process(&raw);
                    if driver.should_terminate() {
                        break;
                    }
                }
            }

            driver.should_terminate()
        };

        self.in_flight.fetch_sub(count, Ordering::SeqCst);
        if self.stalled.swap(false, Ordering::SeqCst) {
            self.reactor.request(ReactorTask::Resume { id: self.id });
        }

        if terminated {
            self.registry.disconnect(self.id);
        }
    }

    /// The peer closed its write side. Runs on the worker pool behind every
    /// decode of the connection's data.
    pub fn hang_up(&self) {
        tracing::debug!(connection_id = self.id, "peer closed");
        self.registry.disconnect(self.id);
    }

    /// Write queued frames until the queue is empty or the socket is full.
    /// The final frame follows once the handle is closed.
    ///
    /// Runs on the reactor thread.
    pub fn continue_write(&self, stream: &mut TcpStream) -> io::Result<WriteProgress> {
        let mut outbound = self.outbound.lock();

        loop {
            if outbound.queue.is_empty()
                && self.closed.load(Ordering::SeqCst)
                && let Some(last) = outbound.last.take()
            {
                outbound.queue.push_back(last);
            }

            let Some(chunk) = outbound.queue.front_mut() else {
                break;
            };
            match stream.write(chunk) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    chunk.advance(written);
                    if chunk.is_empty() {
                        outbound.queue.pop_front();
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending);
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(err),
            }
        }

        Ok(if outbound.sealed && outbound.last.is_none() {
            WriteProgress::Finished
        } else {
            WriteProgress::Drained
        })
    }

    /// Whether the final frame has been queued.
    pub fn is_terminating(&self) -> bool {
        self.outbound.lock().sealed
    }

    /// Whether encoded frames, the final one included, are waiting to be
    /// written.
    pub fn has_pending_writes(&self) -> bool {
        let outbound = self.outbound.lock();
        !outbound.queue.is_empty() || outbound.last.is_some()
    }

    /// Whether the handle was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, frame: &Frame, last: bool) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        {
            let mut outbound = self.outbound.lock();
            if outbound.sealed {
                return false;
            }

            let bytes = FrameCodec::encode_frame(frame);
            if last {
                outbound.last = Some(bytes);
                outbound.sealed = true;
            } else {
                outbound.queue.push_back(bytes);
            }
        }

        tracing::debug!(connection_id = self.id, command = %frame.command, last, "frame queued");
        if last {
            // Written once the registry closes the handle.
            return true;
        }
        self.reactor
            .request(ReactorTask::Interest { id: self.id, interest: Interest::READABLE | Interest::WRITABLE });
        true
    }
}

impl ConnectionHandle for NonBlockingHandler {
    fn send(&self, frame: &Frame) -> bool {
        self.enqueue(frame, false)
    }

    fn finish(&self, frame: &Frame) -> bool {
        self.enqueue(frame, true)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.reactor.request(ReactorTask::Close { id: self.id });
        }
    }
}
