//! Server error types.
//!
//! Provides strongly-typed errors for each layer:
//! - [`RegistryError`]: subscription bookkeeping outcomes
//! - [`FrameRejection`]: fatal protocol conditions, answered with `ERROR`
//! - [`ServerError`]: startup and serve-loop failures

use stompd_proto::ProtocolError;
use thiserror::Error;

use crate::registry::ConnectionId;

/// Errors from registry operations on one connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection is not (or no longer) registered.
    ///
    /// Happens when an I/O failure tore the connection down while one of its
    /// frames was still being processed.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    /// The subscription id is already in use on this connection.
    #[error("subscription id {id:?} already exists")]
    DuplicateSubscriptionId {
        /// Client-chosen subscription id
        id: String,
    },

    /// The connection already subscribes to this destination.
    #[error("already subscribed to {destination:?}")]
    AlreadySubscribed {
        /// Destination name
        destination: String,
    },

    /// No subscription with this id exists on this connection.
    #[error("subscription id {id:?} not found")]
    SubscriptionNotFound {
        /// Client-chosen subscription id
        id: String,
    },
}

/// A fatal protocol condition.
///
/// The `Display` text is the client-visible `message` header of the `ERROR`
/// frame sent before the connection is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameRejection {
    /// The frame could not be parsed.
    #[error("malformed frame received")]
    Malformed(#[from] ProtocolError),

    /// Any command other than `CONNECT` before a successful login.
    #[error("Not connected")]
    NotConnected,

    /// `CONNECT` on a connection that is already logged in.
    #[error("Client already connected")]
    AlreadyConnected,

    /// `CONNECT` without `login` or `passcode`.
    #[error("Missing login or passcode")]
    MissingCredentials,

    /// Password does not match the one the account was created with.
    #[error("Wrong password")]
    WrongPassword,

    /// The username is bound to another live connection.
    #[error("User already logged in")]
    AlreadyLoggedIn,

    /// `SUBSCRIBE` without `destination` or `id`.
    #[error("Missing destination or id")]
    MissingSubscribeHeaders,

    /// `SUBSCRIBE` reusing a subscription id.
    #[error("Subscription id already exists")]
    DuplicateSubscriptionId,

    /// `SUBSCRIBE` to a destination the connection already subscribes to.
    #[error("Already subscribed to destination")]
    AlreadySubscribed,

    /// `UNSUBSCRIBE` without `id`.
    #[error("Missing id")]
    MissingId,

    /// `UNSUBSCRIBE` with an unknown id.
    #[error("Subscription ID not found")]
    SubscriptionNotFound,

    /// `SEND` without `destination`.
    #[error("Missing destination")]
    MissingDestination,

    /// `SEND` to a destination the sender does not subscribe to.
    #[error("User not subscribed to topic")]
    NotSubscribed,

    /// `DISCONNECT` without `receipt`.
    #[error("DISCONNECT must include receipt header")]
    DisconnectWithoutReceipt,

    /// Unrecognised command.
    #[error("Unknown command")]
    UnknownCommand(String),
}

impl FrameRejection {
    /// Whether the `ERROR` frame echoes the request's `receipt` header.
    ///
    /// Parse failures have no trustworthy headers, and a `DISCONNECT` is
    /// rejected precisely because it has none.
    pub fn echoes_receipt(&self) -> bool {
        !matches!(self, Self::Malformed(_) | Self::DisconnectWithoutReceipt)
    }
}

impl From<RegistryError> for FrameRejection {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownConnection(_) => Self::NotConnected,
            RegistryError::DuplicateSubscriptionId { .. } => Self::DuplicateSubscriptionId,
            RegistryError::AlreadySubscribed { .. } => Self::AlreadySubscribed,
            RegistryError::SubscriptionNotFound { .. } => Self::SubscriptionNotFound,
        }
    }
}

/// Errors that stop the server from starting or serving.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration. Fix the configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket, selector or thread-spawn failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A server thread terminated abnormally during shutdown.
    #[error("server thread terminated abnormally")]
    Shutdown,
}
