//! Frame grammar: parsing client frames and rendering server frames.
//!
//! A `Frame` is a pure data holder (command + ordered headers + body). It is
//! parsed from the raw text the [`FrameCodec`](crate::FrameCodec) hands out
//! and rendered back to text before the codec appends the terminator.
//!
//! # Grammar
//!
//! - The header block ends at the first empty line (`\n\n` or `\r\n\r\n`); everything after
//!   it is the body, verbatim. A frame without a blank line has an empty body.
//! - `\r\n` line endings are accepted in the command and header lines. The
//!   body is never rewritten, so a `\r\n` inside it reaches subscribers as is.
//! - The first line is the command. It is trimmed and must not be empty.
//! - Every other line of the header block is trimmed; whitespace-only lines
//!   are skipped, all others must be `name:value` with a non-empty name.
//! - A repeated header name overwrites the earlier value.

use std::fmt;

use crate::{
    Command, FRAME_TERMINATOR, PROTOCOL_VERSION,
    errors::{ProtocolError, Result},
};

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command line
    pub command: Command,

    /// Headers in insertion order, names unique
    headers: Vec<(String, String)>,

    /// Body text (may contain newlines, never the terminator)
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// Parse the raw text of one frame.
    ///
    /// Anything from the first NUL onwards is ignored, so the text may be
    /// passed with or without its terminator.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MissingCommand` if there is no command line
    /// - `ProtocolError::MalformedHeader` if a header line has no `name:`
    pub fn parse(raw: &str) -> Result<Self> {
        // Heart-beat EOLs may precede the command line.
        let text = strip_terminator(raw).trim_start_matches(['\r', '\n']);
        let (head, body) = split_head(text);

        let mut lines = head.split('\n');
        let command = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or(ProtocolError::MissingCommand)?;

        let mut frame = Self::new(Command::from_name(command));

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    frame.set_header(name.trim(), value.trim());
                },
                _ => return Err(ProtocolError::MalformedHeader { line: line.to_string() }),
            }
        }

        frame.body = body.to_string();
        Ok(frame)
    }

    /// Header value by exact name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    /// All headers in order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Set a header, replacing any earlier value with the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Builder form of [`Frame::set_header`].
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Builder form for the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the `receipt` header, if the client asked for one.
    pub fn receipt(&self) -> Option<&str> {
        self.header("receipt")
    }

    /// Render to wire text, without the terminator.
    pub fn render(&self) -> String {
        let headers_len: usize = self.headers.iter().map(|(n, v)| n.len() + v.len() + 2).sum();
        let mut out =
            String::with_capacity(self.command.as_str().len() + headers_len + self.body.len() + 2);

        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }

    /// `CONNECTED` reply to a successful `CONNECT`.
    pub fn connected() -> Self {
        Self::new(Command::Connected).with_header("version", PROTOCOL_VERSION)
    }

    /// `RECEIPT` echoing the client's receipt id.
    pub fn receipt_for(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).with_header("receipt-id", receipt_id)
    }

    /// One `MESSAGE` delivery of a published body.
    ///
    /// `subscription` is the recipient's own subscription id; `message_id` is
    /// shared by every delivery of the same publish.
    pub fn message(destination: &str, subscription: &str, message_id: u64, body: &str) -> Self {
        Self::new(Command::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id.to_string())
            .with_body(body)
    }

    /// `ERROR` frame.
    ///
    /// When `offending` is given, the body quotes the raw frame that caused
    /// the error (terminator stripped) for client-side diagnostics.
    pub fn error(message: &str, receipt_id: Option<&str>, offending: Option<&str>) -> Self {
        let mut frame = Self::new(Command::Error).with_header("message", message);

        if let Some(receipt_id) = receipt_id {
            frame.set_header("receipt-id", receipt_id);
        }

        if let Some(raw) = offending {
            frame.body = format!("The message:\n-----\n{}\n-----\n", strip_terminator(raw));
        }

        frame
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Split at the first empty line, `\n` or `\r\n` terminated. The body is
/// returned untouched.
fn split_head(text: &str) -> (&str, &str) {
    let mut start = 0;
    while let Some(offset) = text[start..].find('\n') {
        let end = start + offset;
        let line = &text[start..end];
        if line.strip_suffix('\r').unwrap_or(line).is_empty() {
            return (&text[..start], &text[end + 1..]);
        }
        start = end + 1;
    }
    (text, "")
}

/// Cut `raw` at its first terminator byte.
fn strip_terminator(raw: &str) -> &str {
    match raw.find(char::from(FRAME_TERMINATOR)) {
        Some(end) => &raw[..end],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameCodec;

    #[test]
    fn parse_connect() {
        let frame = Frame::parse("CONNECT\nlogin:alice\npasscode:x\n\n").unwrap();

        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.header("login"), Some("alice"));
        assert_eq!(frame.header("passcode"), Some("x"));
        assert_eq!(frame.header("receipt"), None);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn parse_keeps_body_verbatim() {
        let frame = Frame::parse("SEND\ndestination:/a\n\nline one\n\nline two\0").unwrap();

        assert_eq!(frame.command, Command::Send);
        assert_eq!(frame.body, "line one\n\nline two");
    }

    #[test]
    fn parse_without_blank_line_has_empty_body() {
        let frame = Frame::parse("DISCONNECT\nreceipt:77").unwrap();

        assert_eq!(frame.receipt(), Some("77"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn parse_skips_whitespace_only_header_lines() {
        let frame = Frame::parse("SUBSCRIBE\ndestination:/a\n   \nid:1\n\n").unwrap();

        assert_eq!(frame.header("destination"), Some("/a"));
        assert_eq!(frame.header("id"), Some("1"));
    }

    #[test]
    fn parse_trims_names_and_values() {
        let frame = Frame::parse("SEND\n destination : /topic/x \n\n").unwrap();

        assert_eq!(frame.header("destination"), Some("/topic/x"));
    }

    #[test]
    fn parse_value_may_contain_colons() {
        let frame = Frame::parse("SEND\ndestination:a:b:c\n\n").unwrap();

        assert_eq!(frame.header("destination"), Some("a:b:c"));
    }

    #[test]
    fn parse_accepts_crlf_header_lines() {
        let frame = Frame::parse("CONNECT\r\nlogin:bob\r\npasscode:pw\r\n\r\n").unwrap();

        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.header("login"), Some("bob"));
        assert_eq!(frame.header("passcode"), Some("pw"));
    }

    #[test]
    fn parse_keeps_crlf_in_body() {
        let frame = Frame::parse("SEND\r\ndestination:/a\r\n\r\nline1\r\nline2\r\n").unwrap();

        assert_eq!(frame.header("destination"), Some("/a"));
        assert_eq!(frame.body, "line1\r\nline2\r\n");
    }

    #[test]
    fn message_body_with_crlf_survives_codec() {
        let body = "line1\r\nline2";
        let encoded = FrameCodec::encode_frame(&Frame::message("/a", "1", 1, body));

        let raw = FrameCodec::new().decode(&encoded);
        let parsed = Frame::parse(&raw[0]).unwrap();

        assert_eq!(parsed.body, body);
    }

    #[test]
    fn parse_repeated_header_keeps_last_value() {
        let frame = Frame::parse("SEND\ndestination:/a\ndestination:/b\n\n").unwrap();

        assert_eq!(frame.header("destination"), Some("/b"));
        assert_eq!(frame.headers().count(), 1);
    }

    #[test]
    fn parse_tolerates_leading_eols() {
        let frame = Frame::parse("\n\nCONNECT\nlogin:a\npasscode:b\n\n").unwrap();

        assert_eq!(frame.command, Command::Connect);
    }

    #[test]
    fn parse_unknown_command() {
        let frame = Frame::parse("BEGIN\ntransaction:t1\n\n").unwrap();

        assert_eq!(frame.command, Command::Other("BEGIN".to_string()));
    }

    #[test]
    fn reject_missing_command() {
        assert_eq!(Frame::parse(""), Err(ProtocolError::MissingCommand));
        assert_eq!(Frame::parse("\0"), Err(ProtocolError::MissingCommand));
        assert_eq!(Frame::parse("   \nlogin:a\n\n"), Err(ProtocolError::MissingCommand));
    }

    #[test]
    fn reject_header_without_colon() {
        let result = Frame::parse("CONNECT\nlogin alice\n\n");

        assert_eq!(result, Err(ProtocolError::MalformedHeader { line: "login alice".to_string() }));
    }

    #[test]
    fn reject_header_with_empty_name() {
        let result = Frame::parse("CONNECT\n:alice\n\n");

        assert!(matches!(result, Err(ProtocolError::MalformedHeader { .. })));
    }

    #[test]
    fn render_message() {
        let frame = Frame::message("/a", "1", 1, "hi");

        assert_eq!(frame.render(), "MESSAGE\ndestination:/a\nsubscription:1\nmessage-id:1\n\nhi");
    }

    #[test]
    fn render_connected_and_receipt() {
        assert_eq!(Frame::connected().render(), "CONNECTED\nversion:1.2\n\n");
        assert_eq!(Frame::receipt_for("r-9").render(), "RECEIPT\nreceipt-id:r-9\n\n");
    }

    #[test]
    fn render_error_with_offending_frame() {
        let frame = Frame::error("Not connected", Some("5"), Some("SEND\nreceipt:5\n\nx\0"));

        assert_eq!(
            frame.render(),
            "ERROR\nmessage:Not connected\nreceipt-id:5\n\nThe message:\n-----\nSEND\nreceipt:5\n\nx\n-----\n"
        );
    }

    #[test]
    fn render_error_without_extras() {
        let frame = Frame::error("malformed frame received", None, None);

        assert_eq!(frame.render(), "ERROR\nmessage:malformed frame received\n\n");
    }

    #[test]
    fn rendered_frame_parses_back() {
        let frame = Frame::message("/topic/games", "sub-7", 42, "first\nsecond");
        let parsed = Frame::parse(&frame.render()).unwrap();

        assert_eq!(parsed, frame);
    }
}
