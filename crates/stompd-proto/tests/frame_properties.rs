//! Property-based tests for frame rendering, parsing and the NUL codec
//!
//! These tests verify that a published body survives the full server path
//! (render, encode, byte-wise decode, parse) for arbitrary bodies and
//! arbitrary read boundaries, not just hand-picked examples.

use proptest::prelude::*;
use stompd_proto::{Command, FRAME_TERMINATOR, Frame, FrameCodec};

/// Strategy for bodies: any text without the terminator, carriage returns
/// included.
fn arbitrary_body() -> impl Strategy<Value = String> {
    "[^\u{0}]{0,512}"
}

/// Strategy for destinations
fn arbitrary_destination() -> impl Strategy<Value = String> {
    "/[a-z0-9_/.-]{1,32}"
}

/// Strategy for client-chosen subscription ids
fn arbitrary_subscription_id() -> impl Strategy<Value = String> {
    "[A-Za-z0-9-]{1,16}"
}

/// Run encoded bytes through a fresh codec one byte at a time.
fn decode_bytewise(bytes: &[u8]) -> Vec<String> {
    let mut codec = FrameCodec::new();
    bytes.iter().filter_map(|b| codec.decode_next_byte(*b)).collect()
}

#[test]
fn prop_body_roundtrip() {
    proptest!(|(
        destination in arbitrary_destination(),
        subscription in arbitrary_subscription_id(),
        message_id in 1u64..u64::MAX,
        body in arbitrary_body(),
    )| {
        let frame = Frame::message(&destination, &subscription, message_id, &body);
        let bytes = FrameCodec::encode_frame(&frame);

        let raw = decode_bytewise(&bytes);
        prop_assert_eq!(raw.len(), 1, "exactly one frame per terminator");

        let parsed = Frame::parse(&raw[0]).expect("rendered frame should parse");

        // PROPERTY: body and headers survive the wire unchanged
        prop_assert_eq!(&parsed.command, &Command::Message);
        prop_assert_eq!(parsed.header("destination"), Some(destination.as_str()));
        prop_assert_eq!(parsed.header("subscription"), Some(subscription.as_str()));
        let expected_id = message_id.to_string();
        prop_assert_eq!(parsed.header("message-id"), Some(expected_id.as_str()));
        prop_assert_eq!(parsed.body, body);
    });
}

#[test]
fn prop_encoded_frame_has_single_terminator() {
    proptest!(|(body in arbitrary_body())| {
        let frame = Frame::new(Command::Send).with_header("destination", "/a").with_body(body);
        let bytes = FrameCodec::encode_frame(&frame);

        // PROPERTY: the terminator appears exactly once, at the end
        let terminators = bytes.iter().filter(|b| **b == FRAME_TERMINATOR).count();
        prop_assert_eq!(terminators, 1);
        prop_assert_eq!(bytes.last().copied(), Some(FRAME_TERMINATOR));
    });
}

#[test]
fn prop_chunk_boundaries_do_not_matter() {
    proptest!(|(
        bodies in prop::collection::vec(arbitrary_body(), 1..8),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
    )| {
        let mut stream = Vec::new();
        for body in &bodies {
            let frame = Frame::new(Command::Send).with_header("destination", "/a").with_body(body.as_str());
            stream.extend_from_slice(&FrameCodec::encode_frame(&frame));
        }

        let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(stream.len())).collect();
        offsets.push(0);
        offsets.push(stream.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut codec = FrameCodec::new();
        let mut raw = Vec::new();
        for window in offsets.windows(2) {
            raw.extend(codec.decode(&stream[window[0]..window[1]]));
        }

        // PROPERTY: chunked decoding equals byte-wise decoding
        prop_assert_eq!(&raw, &decode_bytewise(&stream));
        prop_assert_eq!(raw.len(), bodies.len());
        prop_assert_eq!(codec.pending_len(), 0);

        for (raw, body) in raw.iter().zip(&bodies) {
            let parsed = Frame::parse(raw).expect("rendered frame should parse");
            prop_assert_eq!(&parsed.body, body);
        }
    });
}

#[test]
fn crlf_body_survives_codec_and_parse() {
    let frame = Frame::message("/a", "1", 1, "line1\r\nline2");
    let raw = decode_bytewise(&FrameCodec::encode_frame(&frame));

    let parsed = Frame::parse(&raw[0]).expect("rendered frame should parse");
    assert_eq!(parsed.body, "line1\r\nline2");
}

#[test]
fn prop_parse_never_panics() {
    proptest!(|(raw in "[\\PC\n\r:\u{0}]{0,256}")| {
        // PROPERTY: arbitrary text either parses or yields a typed error
        let _ = Frame::parse(&raw);
    });
}
