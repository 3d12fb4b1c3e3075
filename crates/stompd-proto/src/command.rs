//! Frame commands.

use std::fmt;

/// The first line of a frame.
///
/// Client commands are the ones the server accepts; server commands are the
/// ones it emits. Anything else parses as [`Command::Other`] so the protocol
/// layer can reject it with the raw text in hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    // Client → server
    /// Open a session with `login`/`passcode`
    Connect,
    /// Subscribe to a destination under a client-chosen id
    Subscribe,
    /// Drop a subscription by id
    Unsubscribe,
    /// Publish a body to a destination
    Send,
    /// Graceful close, requires a `receipt` header
    Disconnect,

    // Server → client
    /// Successful `CONNECT`
    Connected,
    /// Acknowledges a frame that carried a `receipt` header
    Receipt,
    /// One delivery of a published body
    Message,
    /// Fatal error, followed by connection close
    Error,

    /// Unrecognised command text
    Other(String),
}

impl Command {
    /// Map a command line to a command. Matching is case-sensitive.
    pub fn from_name(name: &str) -> Self {
        match name {
            "CONNECT" => Self::Connect,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "DISCONNECT" => Self::Disconnect,
            "CONNECTED" => Self::Connected,
            "RECEIPT" => Self::Receipt,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    /// Command line text as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "CONNECT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Receipt => "RECEIPT",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
