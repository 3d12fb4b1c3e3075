//! Per-connection protocol driver.
//!
//! Interprets decoded frames for one connection, drives the shared
//! [`ConnectionRegistry`] and queues replies through it. The driver performs
//! no I/O itself: every outbound frame goes to the connection's registered
//! handle, so the same driver runs under both transports.
//!
//! # States
//!
//! ```text
//! Unauthenticated --CONNECT--> Authenticated --DISCONNECT--> Terminating
//!        |                           |
//!        +------ fatal error --------+-----------------------> Terminating
//! ```
//!
//! `Terminating` is final. The connection's last frame (`ERROR`, or the
//! `RECEIPT` for `DISCONNECT`) seals its outbound queue, and frames that
//! arrive afterwards are ignored.

use std::sync::Arc;

use stompd_proto::{Command, Frame};

use crate::{
    audit::{AuditEvent, AuditLog},
    error::FrameRejection,
    registry::{ConnectionId, ConnectionRegistry, LoginResult},
};

/// Protocol state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Only `CONNECT` is accepted
    Unauthenticated,
    /// Logged in
    Authenticated {
        /// Bound username
        username: String,
    },
    /// Final frame queued; the connection is being closed
    Terminating,
}

/// Protocol state machine for one connection.
pub struct ProtocolDriver {
    connection_id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    audit: Arc<dyn AuditLog>,
    state: SessionState,
}

impl std::fmt::Debug for ProtocolDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDriver")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProtocolDriver {
    /// Create a driver for a freshly accepted connection.
    pub fn new(
        connection_id: ConnectionId,
        registry: Arc<ConnectionRegistry>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self { connection_id, registry, audit, state: SessionState::Unauthenticated }
    }

    /// Connection this driver serves.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Current protocol state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether the connection should be closed once its queue drains.
    pub fn should_terminate(&self) -> bool {
        self.state == SessionState::Terminating
    }

    /// Process one raw frame as produced by the codec.
    pub fn process(&mut self, raw: &str) {
        if self.should_terminate() {
            tracing::debug!(connection_id = self.connection_id, "frame after termination ignored");
            return;
        }

        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(connection_id = self.connection_id, error = %err, "parse failed");
                self.reject(&FrameRejection::Malformed(err), None, raw);
                return;
            },
        };

        tracing::debug!(connection_id = self.connection_id, command = %frame.command, "frame received");

        if let Err(rejection) = self.dispatch(&frame) {
            let receipt = if rejection.echoes_receipt() { frame.receipt() } else { None };
            self.reject(&rejection, receipt, raw);
        }
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<(), FrameRejection> {
        let username = match (&self.state, &frame.command) {
            (SessionState::Unauthenticated, Command::Connect) => return self.on_connect(frame),
            (SessionState::Unauthenticated, _) => return Err(FrameRejection::NotConnected),
            (SessionState::Authenticated { username }, _) => username.clone(),
            (SessionState::Terminating, _) => return Ok(()),
        };

        match &frame.command {
            Command::Connect => Err(FrameRejection::AlreadyConnected),
            Command::Subscribe => self.on_subscribe(frame),
            Command::Unsubscribe => self.on_unsubscribe(frame),
            Command::Send => self.on_send(frame, username),
            Command::Disconnect => self.on_disconnect(frame, username),
            other => Err(FrameRejection::UnknownCommand(other.to_string())),
        }
    }

    fn on_connect(&mut self, frame: &Frame) -> Result<(), FrameRejection> {
        let (Some(login), Some(passcode)) = (frame.header("login"), frame.header("passcode"))
        else {
            return Err(FrameRejection::MissingCredentials);
        };

        match self.registry.login(self.connection_id, login, passcode)? {
            LoginResult::WrongPassword => return Err(FrameRejection::WrongPassword),
            LoginResult::AlreadyLoggedIn => return Err(FrameRejection::AlreadyLoggedIn),
            LoginResult::Registered => {
                self.audit.record(AuditEvent::AccountCreated {
                    username: login.to_string(),
                    password: passcode.to_string(),
                });
                self.audit.record(AuditEvent::Login { username: login.to_string() });
            },
            LoginResult::LoggedIn => {
                self.audit.record(AuditEvent::Login { username: login.to_string() });
            },
        }

        tracing::info!(connection_id = self.connection_id, user = login, "login");
        self.state = SessionState::Authenticated { username: login.to_string() };

        self.reply(&Frame::connected());
        self.acknowledge(frame);
        Ok(())
    }

    fn on_subscribe(&mut self, frame: &Frame) -> Result<(), FrameRejection> {
        let (Some(destination), Some(id)) = (frame.header("destination"), frame.header("id"))
        else {
            return Err(FrameRejection::MissingSubscribeHeaders);
        };

        self.registry.subscribe(self.connection_id, destination, id)?;
        self.acknowledge(frame);
        Ok(())
    }

    fn on_unsubscribe(&mut self, frame: &Frame) -> Result<(), FrameRejection> {
        let id = frame.header("id").ok_or(FrameRejection::MissingId)?;

        self.registry.unsubscribe(self.connection_id, id)?;
        self.acknowledge(frame);
        Ok(())
    }

    fn on_send(&mut self, frame: &Frame, username: String) -> Result<(), FrameRejection> {
        let destination = frame.header("destination").ok_or(FrameRejection::MissingDestination)?;

        if !self.registry.is_subscribed(self.connection_id, destination) {
            return Err(FrameRejection::NotSubscribed);
        }

        let message_id = self.registry.next_message_id();
        let delivered = self.registry.send_to_channel(destination, |subscription| {
            Frame::message(destination, subscription, message_id, &frame.body)
        });

        tracing::debug!(
            connection_id = self.connection_id,
            destination,
            message_id,
            delivered,
            "published"
        );

        self.audit.record(AuditEvent::Published { username, destination: destination.to_string() });
        self.acknowledge(frame);
        Ok(())
    }

    fn on_disconnect(&mut self, frame: &Frame, username: String) -> Result<(), FrameRejection> {
        let receipt = frame.receipt().ok_or(FrameRejection::DisconnectWithoutReceipt)?;

        self.audit.record(AuditEvent::Logout { username });
        self.state = SessionState::Terminating;
        self.registry.finish(self.connection_id, &Frame::receipt_for(receipt));
        Ok(())
    }

    /// Send the single `ERROR` frame for a fatal condition and terminate.
    fn reject(&mut self, rejection: &FrameRejection, receipt: Option<&str>, raw: &str) {
        tracing::warn!(connection_id = self.connection_id, error = %rejection, "frame rejected");

        self.state = SessionState::Terminating;
        let error = Frame::error(&rejection.to_string(), receipt, Some(raw));
        self.registry.finish(self.connection_id, &error);
    }

    fn reply(&self, frame: &Frame) {
        if !self.registry.send_to(self.connection_id, frame) {
            tracing::debug!(connection_id = self.connection_id, command = %frame.command, "reply dropped");
        }
    }

    /// Send a `RECEIPT` if the frame asked for one.
    fn acknowledge(&self, frame: &Frame) {
        if let Some(receipt) = frame.receipt() {
            self.reply(&Frame::receipt_for(receipt));
        }
    }
}
