//! Frame grammar errors.
//!
//! Every variant is fatal for the connection that sent the frame: the server
//! answers with an `ERROR` frame and closes the connection.

use thiserror::Error;

/// Result alias for frame grammar operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing a raw frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame has no command line (empty or whitespace-only first line).
    #[error("frame has no command line")]
    MissingCommand,

    /// A non-blank header line without a `name:` prefix.
    #[error("malformed header line: {line:?}")]
    MalformedHeader {
        /// The offending header line, trimmed
        line: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display() {
        assert_eq!(ProtocolError::MissingCommand.to_string(), "frame has no command line");

        let err = ProtocolError::MalformedHeader { line: "nocolon".to_string() };
        assert_eq!(err.to_string(), "malformed header line: \"nocolon\"");
    }
}
