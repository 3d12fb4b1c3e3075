//! Fuzz target for Frame::parse
//!
//! Feeds arbitrary bytes through the codec and parses whatever frames come
//! out, looking for:
//! - Parser panics on odd line endings or header shapes
//! - Slicing on non-char boundaries after lossy UTF-8 decoding
//!
//! The fuzzer should NEVER panic. Invalid frames must come back as errors.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stompd_proto::{Frame, FrameCodec};

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new();
    for raw in codec.decode(data) {
        if let Ok(frame) = Frame::parse(&raw) {
            // A parsed frame renders to text that parses to the same frame.
            let reparsed = Frame::parse(&frame.render());
            assert_eq!(reparsed.ok().map(|f| f.headers().count()), Some(frame.headers().count()));
        }
    }
});
