//! Fuzz target for codec read boundaries
//!
//! The same byte stream is decoded three ways: in one call, byte by byte and
//! in fuzzer-chosen chunks. Socket reads can split a stream anywhere, so all
//! three must yield the same frames.
//!
//! # Invariants
//!
//! - Frame boundaries depend only on terminator positions
//! - Bytes after the last terminator stay pending, nothing is lost
//! - Decoded frames never contain the terminator

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stompd_proto::{FRAME_TERMINATOR, FrameCodec};

#[derive(Debug, Clone, Arbitrary)]
struct SplitStream {
    data: Vec<u8>,
    cuts: Vec<u16>,
}

fuzz_target!(|input: SplitStream| {
    let whole = FrameCodec::new().decode(&input.data);

    let mut bytewise = FrameCodec::new();
    let by_byte: Vec<String> =
        input.data.iter().filter_map(|b| bytewise.decode_next_byte(*b)).collect();

    let mut chunked = FrameCodec::new();
    let mut by_chunk = Vec::new();
    let mut rest = input.data.as_slice();
    for cut in &input.cuts {
        let at = usize::from(*cut).min(rest.len());
        let (chunk, tail) = rest.split_at(at);
        by_chunk.extend(chunked.decode(chunk));
        rest = tail;
    }
    by_chunk.extend(chunked.decode(rest));

    assert_eq!(whole, by_byte);
    assert_eq!(whole, by_chunk);
    assert_eq!(bytewise.pending_len(), chunked.pending_len());

    let terminators = input.data.iter().filter(|b| **b == FRAME_TERMINATOR).count();
    assert_eq!(whole.len(), terminators);
    assert!(whole.iter().all(|raw| !raw.contains(char::from(FRAME_TERMINATOR))));
});
