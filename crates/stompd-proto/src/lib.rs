//! Wire format for the stompd message broker.
//!
//! A frame is a text block of the form
//!
//! ```text
//! COMMAND
//! header-name:header-value
//! ...
//!
//! [BODY]^@
//! ```
//!
//! terminated by a single NUL byte (`^@`). This crate knows nothing about
//! sessions or subscriptions: [`FrameCodec`] cuts a byte stream into raw frame
//! strings, [`Frame::parse`] turns a raw string into a command plus headers and
//! body, and [`Frame::render`] goes the other way for server-emitted frames.

#![forbid(unsafe_code)]

mod codec;
mod command;
pub mod errors;
mod frame;

pub use codec::{FRAME_TERMINATOR, FrameCodec};
pub use command::Command;
pub use errors::{ProtocolError, Result};
pub use frame::Frame;

/// Protocol version announced in the `CONNECTED` frame.
pub const PROTOCOL_VERSION: &str = "1.2";
