//! Server configuration.

use std::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
};

use crate::error::ServerError;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7777;

/// Default size of one pooled read buffer (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1 << 13;

/// Default number of readiness events handled per reactor wake-up.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// How accepted connections are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// One readiness loop thread plus a keyed worker pool
    #[default]
    Reactor,
    /// One blocking OS thread per connection
    ThreadPerClient,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Transport driving accepted connections
    pub transport: TransportMode,
    /// Worker pool threads (reactor transport only), at least 1
    pub worker_threads: usize,
    /// Size of each pooled read buffer
    pub read_buffer_size: usize,
    /// Free-list bound of the read buffer pool; `None` means four per worker
    pub buffer_pool_capacity: Option<usize>,
    /// Readiness events handled per reactor wake-up
    pub events_capacity: usize,
    /// Audit sink address; `None` disables auditing
    pub audit_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            transport: TransportMode::default(),
            worker_threads: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            buffer_pool_capacity: None,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            audit_addr: None,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the transport mode.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    /// Set the worker thread count. Zero is clamped to one.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Set the read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the read buffer pool bound.
    #[must_use]
    pub fn with_buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = Some(capacity);
        self
    }

    /// Set the readiness events capacity.
    #[must_use]
    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    /// Enable the SQL audit sink at `addr`.
    #[must_use]
    pub fn with_audit_addr(mut self, addr: SocketAddr) -> Self {
        self.audit_addr = Some(addr);
        self
    }

    /// Effective read buffer pool bound.
    pub fn pool_capacity(&self) -> usize {
        self.buffer_pool_capacity.unwrap_or(self.worker_threads.max(1) * 4)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.read_buffer_size == 0 {
            return Err(ServerError::Config("read buffer size must be non-zero".to_string()));
        }

        if self.events_capacity == 0 {
            return Err(ServerError::Config("events capacity must be non-zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 7777);
        assert_eq!(config.transport, TransportMode::Reactor);
        assert!(config.worker_threads >= 1);
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.pool_capacity(), config.worker_threads * 4);
        assert!(config.audit_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_clamped() {
        let config = ServerConfig::new().with_worker_threads(0);

        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.pool_capacity(), 4);
    }

    #[test]
    fn explicit_pool_capacity_wins() {
        let config = ServerConfig::new().with_worker_threads(8).with_buffer_pool_capacity(3);

        assert_eq!(config.pool_capacity(), 3);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        assert!(matches!(
            ServerConfig::new().with_read_buffer_size(0).validate(),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::new().with_events_capacity(0).validate(),
            Err(ServerError::Config(_))
        ));
    }
}
