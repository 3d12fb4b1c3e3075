//! Readiness loop for the reactor transport.
//!
//! One thread owns the [`Poll`], the listener and every connection's socket.
//! It is the only thread that registers, reregisters or deregisters sockets;
//! other threads ask for interest changes through a [`ReactorHandle`], which
//! queues a [`ReactorTask`] and wakes the poll. Queued tasks are applied right
//! after each wake-up, before readiness events are dispatched.
//!
//! Reads and writes happen on the reactor thread (they never block). Decoding
//! and protocol processing are submitted to a [`KeyedPool`] keyed by
//! connection id. A task that panics disconnects its connection.
//!
//! A closed connection keeps its socket until its outbound queue, final frame
//! included, has been flushed.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender};
use mio::{
    Events, Interest, Poll, Token, Waker,
    event::Event,
    net::{TcpListener, TcpStream},
};

use crate::{
    audit::AuditLog,
    buffer_pool::BufferPool,
    config::ServerConfig,
    error::ServerError,
    handler::{NonBlockingHandler, WriteProgress},
    pool::KeyedPool,
    registry::{ConnectionId, ConnectionRegistry},
};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

/// Interest change or close requested from outside the reactor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorTask {
    /// Watch the connection's socket for `interest`
    Interest {
        /// Connection
        id: ConnectionId,
        /// New interest set
        interest: Interest,
    },
    /// Read again after a stall at the in-flight limit
    Resume {
        /// Connection
        id: ConnectionId,
    },
    /// Deregister and drop the connection's socket
    Close {
        /// Connection
        id: ConnectionId,
    },
}

/// Cloneable handle for queueing [`ReactorTask`]s.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    tasks: Sender<ReactorTask>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Queue a task and wake the reactor.
    pub fn request(&self, task: ReactorTask) {
        if self.tasks.send(task).is_err() {
            // Reactor already gone; nothing left to mutate.
            return;
        }

        if let Err(err) = self.waker.wake() {
            tracing::error!(error = %err, "failed to wake reactor");
        }
    }

    /// Wake the reactor without queueing anything.
    pub fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            tracing::error!(error = %err, "failed to wake reactor");
        }
    }
}

/// A live connection as seen by the reactor.
struct Slot {
    stream: TcpStream,
    handler: Arc<NonBlockingHandler>,
}

/// Single-threaded readiness loop.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    handle: ReactorHandle,
    tasks: Receiver<ReactorTask>,
    slots: HashMap<ConnectionId, Slot>,
    next_id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    audit: Arc<dyn AuditLog>,
    buffers: Arc<BufferPool>,
    pool: KeyedPool<ConnectionId>,
    events_capacity: usize,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("connections", &self.slots.len())
            .field("next_id", &self.next_id)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Set up the poll, register the listener and start the worker pool.
    pub fn new(
        listener: std::net::TcpListener,
        config: &ServerConfig,
        registry: Arc<ConnectionRegistry>,
        audit: Arc<dyn AuditLog>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (tx, tasks) = crossbeam_channel::unbounded();
        let failed = Arc::clone(&registry);
        let on_failure = move |id: &ConnectionId| {
            tracing::warn!(connection_id = *id, "dropping connection after task failure");
            failed.disconnect(*id);
        };
        let pool = KeyedPool::with_failure_hook(config.worker_threads, "stompd-worker", on_failure)?;

        Ok(Self {
            poll,
            listener,
            handle: ReactorHandle { tasks: tx, waker },
            tasks,
            slots: HashMap::new(),
            next_id: 1,
            registry,
            audit,
            buffers: BufferPool::new(config.read_buffer_size, config.pool_capacity()),
            pool,
            events_capacity: config.events_capacity,
            shutdown,
        })
    }

    /// Handle for queueing tasks and waking the loop.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Read buffers shared by every connection.
    pub fn buffers(&self) -> Arc<BufferPool> {
        Arc::clone(&self.buffers)
    }

    /// Run until the shutdown flag is set and the reactor is woken.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.events_capacity);
        tracing::info!(
            addr = ?self.local_addr().ok(),
            workers = self.pool.threads(),
            "reactor running"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "poll failed");
                self.stop()?;
                return Err(err.into());
            }

            self.drain_tasks();

            for event in &events {
                self.dispatch(event);
            }
        }

        self.stop()
    }

    fn dispatch(&mut self, event: &Event) {
        match event.token() {
            LISTENER => self.accept_all(),
            WAKER => {},
            Token(token) => {
                let id = token as ConnectionId;

                if event.is_error() {
                    tracing::debug!(connection_id = id, "socket error event");
                    self.teardown(id);
                    return;
                }
                if event.is_readable() || event.is_read_closed() {
                    self.on_readable(id);
                }
                if event.is_writable() {
                    self.on_writable(id);
                }
            },
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    return;
                },
            }
        }
    }

    fn accept(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        if let Err(err) = self.poll.registry().register(&mut stream, Token(id as usize), Interest::READABLE)
        {
            tracing::error!(connection_id = id, %peer, error = %err, "failed to register socket");
            return;
        }

        let handler = Arc::new(NonBlockingHandler::new(
            id,
            peer,
            self.handle.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.audit),
            Arc::clone(&self.buffers),
        ));

        if !self.registry.register(id, handler.clone()) {
            tracing::error!(connection_id = id, "connection id already registered");
            if let Err(err) = self.poll.registry().deregister(&mut stream) {
                tracing::debug!(connection_id = id, error = %err, "deregister failed");
            }
            return;
        }

        tracing::info!(connection_id = id, %peer, "connection accepted");
        self.slots.insert(id, Slot { stream, handler: Arc::clone(&handler) });
        self.pool.submit(id, move || handler.start());
    }

    fn on_readable(&mut self, id: ConnectionId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };

        match slot.handler.continue_read(&mut slot.stream) {
            Ok(pass) => {
                if !pass.chunks.is_empty() {
                    let handler = Arc::clone(&slot.handler);
                    self.pool.submit(id, move || handler.decode(pass.chunks));
                }

                if pass.eof {
                    // Behind any pending decode for this connection.
                    let handler = Arc::clone(&slot.handler);
                    self.pool.submit(id, move || handler.hang_up());
                }
            },
            Err(err) => {
                tracing::debug!(connection_id = id, error = %err, "read failed");
                self.teardown(id);
            },
        }
    }

    fn on_writable(&mut self, id: ConnectionId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };

        match slot.handler.continue_write(&mut slot.stream) {
            Ok(WriteProgress::Pending) => {},
            Ok(WriteProgress::Drained) if slot.handler.is_closed() => self.release(id),
            Ok(WriteProgress::Drained) => self.set_interest(id, Interest::READABLE),
            Ok(WriteProgress::Finished) => self.teardown(id),
            Err(err) => {
                tracing::debug!(connection_id = id, error = %err, "write failed");
                self.teardown(id);
            },
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                ReactorTask::Interest { id, interest } => self.set_interest(id, interest),
                ReactorTask::Resume { id } => self.on_readable(id),
                ReactorTask::Close { id } => self.close(id),
            }
        }
    }

    fn set_interest(&mut self, id: ConnectionId, interest: Interest) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };

        if let Err(err) = self.poll.registry().reregister(&mut slot.stream, Token(id as usize), interest) {
            tracing::debug!(connection_id = id, error = %err, "reregister failed");
            self.teardown(id);
            return;
        }
        tracing::trace!(connection_id = id, ?interest, "interest updated");
    }

    /// Release a closed connection once its queue is flushed.
    fn close(&mut self, id: ConnectionId) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };

        if slot.handler.has_pending_writes() {
            tracing::debug!(connection_id = id, "flushing before close");
            self.set_interest(id, Interest::WRITABLE);
            return;
        }
        self.release(id);
    }

    /// Implicit disconnect from the reactor side. The registry forgets the
    /// connection before the socket is dropped, so a peer that sees EOF can
    /// log straight back in.
    fn teardown(&mut self, id: ConnectionId) {
        self.registry.disconnect(id);
        self.release(id);
    }

    /// Deregister and drop a connection's socket.
    fn release(&mut self, id: ConnectionId) {
        if let Some(mut slot) = self.slots.remove(&id) {
            if let Err(err) = self.poll.registry().deregister(&mut slot.stream) {
                tracing::debug!(connection_id = id, error = %err, "deregister failed");
            }
            tracing::info!(connection_id = id, terminating = slot.handler.is_terminating(), "connection closed");
        }
    }

    /// Tear every connection down and stop the worker pool.
    fn stop(&mut self) -> Result<(), ServerError> {
        tracing::info!(connections = self.slots.len(), "reactor shutting down");

        let ids: Vec<ConnectionId> = self.slots.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
        self.registry.disconnect_all();
        self.drain_tasks();

        self.pool.shutdown()
    }
}
