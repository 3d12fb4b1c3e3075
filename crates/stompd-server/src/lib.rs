//! STOMP 1.2 message broker.
//!
//! Clients connect over TCP, log in with `CONNECT`, subscribe to named
//! destinations and publish bodies that are fanned out to every subscriber.
//!
//! # Architecture
//!
//! All connection handling funnels into one [`ProtocolDriver`] per connection,
//! which validates frames against the session state and applies them to the
//! shared [`ConnectionRegistry`]. Two interchangeable transports feed it:
//!
//! - [`Reactor`]: one readiness loop thread owning every socket, with decoding
//!   and processing running on a [`KeyedPool`] keyed by connection id
//! - [`BlockingServer`]: one blocking OS thread per connection
//!
//! [`Server`] picks the transport from [`ServerConfig`], and
//! [`ShutdownHandle`] stops it from any thread.

#![forbid(unsafe_code)]

mod audit;
pub mod blocking;
pub mod buffer_pool;
mod config;
mod driver;
mod error;
pub mod handler;
pub mod pool;
pub mod reactor;
mod registry;

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

pub use audit::{AuditEvent, AuditLog, NoopAudit, SqlAuditLog};
pub use blocking::{BlockingHandler, BlockingServer};
pub use buffer_pool::{BufferPool, LeasedBuffer};
pub use config::{
    DEFAULT_EVENTS_CAPACITY, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE, ServerConfig, TransportMode,
};
pub use driver::{ProtocolDriver, SessionState};
pub use error::{FrameRejection, RegistryError, ServerError};
pub use handler::{MAX_CHUNKS_IN_FLIGHT, NonBlockingHandler};
pub use pool::KeyedPool;
pub use reactor::{Reactor, ReactorHandle};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, LoginResult};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

enum Transport {
    Reactor(Reactor),
    ThreadPerClient(BlockingServer),
}

#[derive(Debug, Clone)]
enum Wake {
    Reactor(ReactorHandle),
    Listener(SocketAddr),
}

/// Stops a running [`Server`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Wake,
}

impl ShutdownHandle {
    /// Ask the server to stop. [`Server::run`] returns once every connection
    /// has been closed. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }

        match &self.wake {
            Wake::Reactor(handle) => handle.wake(),
            Wake::Listener(addr) => {
                // Unblocks the accept loop, which then sees the flag.
                if let Err(err) = TcpStream::connect_timeout(&loopback(*addr), WAKE_TIMEOUT) {
                    tracing::warn!(%addr, error = %err, "failed to wake accept loop");
                }
            },
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Connectable form of a listen address.
fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port())),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::from((Ipv6Addr::LOCALHOST, addr.port())),
        _ => addr,
    }
}

/// A bound broker, ready to run.
pub struct Server {
    transport: Transport,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: ShutdownHandle,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.transport {
            Transport::Reactor(_) => TransportMode::Reactor,
            Transport::ThreadPerClient(_) => TransportMode::ThreadPerClient,
        };
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("transport", &mode)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Validate `config`, bind the listener and set up the configured
    /// transport and audit sink.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let audit: Arc<dyn AuditLog> = match config.audit_addr {
            Some(addr) => {
                tracing::info!(%addr, "auditing to SQL service");
                Arc::new(SqlAuditLog::spawn(addr)?)
            },
            None => Arc::new(NoopAudit),
        };

        Self::bind_with_audit(config, audit)
    }

    /// Like [`Server::bind`], with a caller-supplied audit sink.
    /// `config.audit_addr` is ignored.
    pub fn bind_with_audit(config: ServerConfig, audit: Arc<dyn AuditLog>) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(ConnectionRegistry::new());
        let flag = Arc::new(AtomicBool::new(false));

        let (transport, wake) = match config.transport {
            TransportMode::Reactor => {
                let reactor =
                    Reactor::new(listener, &config, Arc::clone(&registry), audit, Arc::clone(&flag))?;
                let wake = Wake::Reactor(reactor.handle());
                (Transport::Reactor(reactor), wake)
            },
            TransportMode::ThreadPerClient => {
                let server = BlockingServer::new(
                    listener,
                    Arc::clone(&registry),
                    audit,
                    config.read_buffer_size,
                    Arc::clone(&flag),
                );
                (Transport::ThreadPerClient(server), Wake::Listener(local_addr))
            },
        };

        tracing::info!(addr = %local_addr, mode = ?config.transport, "server bound");
        Ok(Self { transport, local_addr, registry, shutdown: ShutdownHandle { flag, wake } })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server once it runs.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// The registry shared by every connection.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Read buffers of the reactor transport. The thread-per-client transport
    /// reads into per-thread buffers and has none.
    pub fn read_buffers(&self) -> Option<Arc<BufferPool>> {
        match &self.transport {
            Transport::Reactor(reactor) => Some(reactor.buffers()),
            Transport::ThreadPerClient(_) => None,
        }
    }

    /// Serve connections until [`ShutdownHandle::shutdown`] is called or the
    /// transport fails.
    pub fn run(self) -> Result<(), ServerError> {
        let result = match self.transport {
            Transport::Reactor(reactor) => reactor.run(),
            Transport::ThreadPerClient(server) => server.run(),
        };

        match &result {
            Ok(()) => tracing::info!(addr = %self.local_addr, "server stopped"),
            Err(err) => tracing::error!(addr = %self.local_addr, error = %err, "server failed"),
        }
        result
    }
}

/// Whether `err` means the peer went away rather than a local fault.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
