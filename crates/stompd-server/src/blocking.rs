//! Thread-per-connection transport.
//!
//! A blocking accept loop hands every connection its own OS thread, which
//! reads from the socket, feeds the codec byte by byte and runs the protocol
//! driver inline. Outbound frames are written immediately under the
//! connection's writer lock. A connection's final frame is held back until
//! the handle is closed, which happens after the registry has forgotten the
//! connection, so a client reacting to it can log straight back in. Uses the
//! same registry and driver as the reactor transport, so clients cannot tell
//! the two apart.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use parking_lot::Mutex;
use stompd_proto::{Frame, FrameCodec};

use crate::{
    audit::AuditLog,
    driver::ProtocolDriver,
    error::ServerError,
    registry::{ConnectionHandle, ConnectionId, ConnectionRegistry},
};

/// Write side of one blocking connection.
struct Writer {
    stream: TcpStream,
    sealed: bool,
    /// Final frame, written on close
    last: Option<Bytes>,
}

/// Outbound handle of a blocking connection.
pub struct BlockingHandler {
    id: ConnectionId,
    writer: Mutex<Writer>,
    /// Separate clone so `close` never waits behind a blocked write
    control: TcpStream,
    closed: AtomicBool,
    /// A final frame waits in the writer
    holding_last: AtomicBool,
}

impl std::fmt::Debug for BlockingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingHandler")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BlockingHandler {
    /// Create a handler writing to clones of `stream`.
    pub fn new(id: ConnectionId, stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            id,
            writer: Mutex::new(Writer { stream: stream.try_clone()?, sealed: false, last: None }),
            control: stream.try_clone()?,
            closed: AtomicBool::new(false),
            holding_last: AtomicBool::new(false),
        })
    }

    fn write(&self, frame: &Frame) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let mut writer = self.writer.lock();
        if writer.sealed {
            return false;
        }

        let bytes = FrameCodec::encode_frame(frame);
        match writer.stream.write_all(&bytes).and_then(|()| writer.stream.flush()) {
            Ok(()) => {
                tracing::debug!(connection_id = self.id, command = %frame.command, "frame sent");
                true
            },
            Err(err) => {
                tracing::debug!(connection_id = self.id, error = %err, "write failed");
                writer.sealed = true;
                drop(writer);
                self.close();
                false
            },
        }
    }

    /// Write the held-back final frame, if any.
    fn flush_last(&self) {
        let mut writer = self.writer.lock();
        let Some(bytes) = writer.last.take() else {
            return;
        };

        if let Err(err) = writer.stream.write_all(&bytes).and_then(|()| writer.stream.flush()) {
            tracing::debug!(connection_id = self.id, error = %err, "final write failed");
        }
    }
}

impl ConnectionHandle for BlockingHandler {
    fn send(&self, frame: &Frame) -> bool {
        self.write(frame)
    }

    fn finish(&self, frame: &Frame) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let mut writer = self.writer.lock();
        if writer.sealed {
            return false;
        }
        writer.sealed = true;
        writer.last = Some(FrameCodec::encode_frame(frame));
        self.holding_last.store(true, Ordering::SeqCst);
        tracing::debug!(connection_id = self.id, command = %frame.command, "final frame held");
        true
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.holding_last.load(Ordering::SeqCst) {
            self.flush_last();
        }

        if let Err(err) = self.control.shutdown(Shutdown::Both)
            && err.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(connection_id = self.id, error = %err, "socket shutdown failed");
        }
    }
}

/// Blocking accept loop.
pub struct BlockingServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    audit: Arc<dyn AuditLog>,
    read_buffer_size: usize,
    shutdown: Arc<AtomicBool>,
    next_id: ConnectionId,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BlockingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingServer")
            .field("next_id", &self.next_id)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

impl BlockingServer {
    /// Create the accept loop over a bound listener.
    pub fn new(
        listener: TcpListener,
        registry: Arc<ConnectionRegistry>,
        audit: Arc<dyn AuditLog>,
        read_buffer_size: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            listener,
            registry,
            audit,
            read_buffer_size,
            shutdown,
            next_id: 1,
            threads: Vec::new(),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then close every connection and join their
    /// threads.
    pub fn run(mut self) -> Result<(), ServerError> {
        tracing::info!(addr = ?self.local_addr().ok(), "thread-per-client transport running");

        loop {
            let accepted = self.listener.accept();
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => tracing::error!(error = %err, "accept failed"),
            }

            self.threads.retain(|thread| !thread.is_finished());
        }

        tracing::info!(connections = self.registry.connection_count(), "shutting down");
        self.registry.disconnect_all();

        let mut clean = true;
        for thread in self.threads.drain(..) {
            clean &= thread.join().is_ok();
        }

        if clean { Ok(()) } else { Err(ServerError::Shutdown) }
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        let handler = match BlockingHandler::new(id, &stream) {
            Ok(handler) => Arc::new(handler),
            Err(err) => {
                tracing::error!(connection_id = id, %peer, error = %err, "failed to clone socket");
                return;
            },
        };

        if !self.registry.register(id, handler) {
            tracing::error!(connection_id = id, "connection id already registered");
            return;
        }
        tracing::info!(connection_id = id, %peer, "connection accepted");

        let driver = ProtocolDriver::new(id, Arc::clone(&self.registry), Arc::clone(&self.audit));
        let registry = Arc::clone(&self.registry);
        let buffer_size = self.read_buffer_size;

        let spawned = thread::Builder::new().name(format!("stompd-conn-{id}")).spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| serve(stream, driver, &registry, buffer_size))).is_err() {
                tracing::error!(connection_id = id, "connection thread panicked");
                registry.disconnect(id);
            }
        });

        match spawned {
            Ok(thread) => self.threads.push(thread),
            Err(err) => {
                tracing::error!(connection_id = id, error = %err, "failed to spawn connection thread");
                self.registry.disconnect(id);
            },
        }
    }
}

/// Read, decode and process until termination, EOF or an I/O error.
fn serve(
    mut stream: TcpStream,
    mut driver: ProtocolDriver,
    registry: &ConnectionRegistry,
    buffer_size: usize,
) {
    let id = driver.connection_id();
    let mut codec = FrameCodec::new();
    let mut buffer = vec![0u8; buffer_size];

    'read: loop {
        let len = match stream.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(connection_id = id, "peer closed");
                break;
            },
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if crate::is_disconnect(&err) => {
                tracing::debug!(connection_id = id, error = %err, "peer reset");
                break;
            },
            Err(err) => {
                tracing::warn!(connection_id = id, error = %err, "read failed");
                break;
            },
        };

        for byte in &buffer[..len] {
            if let Some(raw) = codec.decode_next_byte(*byte) {
                driver.process(&raw);
                if driver.should_terminate() {
                    break 'read;
                }
            }
        }
    }

    registry.disconnect(id);
    tracing::info!(connection_id = id, "connection closed");
}
