// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framing laws for the Fortinet codec: round-trips, prefix-decoding
//! and fatal violations, exercised through the public API.

use fortitun::ppp::frame::{
    encode, encode_into, FrameDecoder, FramingError, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

#[test]
fn decode_of_encode_is_identity() {
    for size in [1usize, 2, 7, 64, 1500, 4096, MAX_PAYLOAD_SIZE] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 256) as u8).collect();
        let wire = encode(&payload).unwrap();
        assert_eq!(wire.len(), payload.len() + FRAME_HEADER_SIZE);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire).unwrap();
        assert_eq!(decoded, vec![payload], "size {}", size);
    }
}

#[test]
fn concatenated_suffix_does_not_change_first_payload() {
    let payload = b"\xff\x03\x00\x21ip packet".to_vec();
    let reference = {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode(&payload).unwrap()).unwrap()
    };

    // The same frame followed by arbitrary suffixes of another valid
    // frame decodes the first payload identically.
    let second = encode(b"suffix").unwrap();
    for cut in 0..second.len() {
        let mut wire = encode(&payload).unwrap();
        wire.extend_from_slice(&second[..cut]);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire).unwrap();
        assert_eq!(decoded, reference, "suffix length {}", cut);
    }
}

#[test]
fn any_split_of_the_stream_decodes_identically() {
    let mut wire = Vec::new();
    encode_into(b"first", &mut wire).unwrap();
    encode_into(&[0xAA; 300], &mut wire).unwrap();
    encode_into(b"third", &mut wire).unwrap();

    for split in 1..wire.len() {
        let mut decoder = FrameDecoder::new();
        let mut decoded = decoder.feed(&wire[..split]).unwrap();
        decoded.extend(decoder.feed(&wire[split..]).unwrap());

        assert_eq!(decoded.len(), 3, "split at {}", split);
        assert_eq!(decoded[0], b"first");
        assert_eq!(decoded[1].len(), 300);
        assert_eq!(decoded[2], b"third");
    }
}

#[test]
fn magic_violation_delivers_nothing_and_stays_fatal() {
    let mut wire = encode(b"payload").unwrap();
    wire[3] = 0x00;

    let mut decoder = FrameDecoder::new();
    assert!(decoder.feed(&wire).is_err());
    assert_eq!(decoder.frames_decoded(), 0);
    assert_eq!(decoder.bytes_decoded(), 0);

    // No recovery on subsequent well-formed input.
    assert!(decoder.feed(&encode(b"ok").unwrap()).is_err());
    assert_eq!(decoder.frames_decoded(), 0);
}

#[test]
fn total_length_must_equal_payload_plus_header() {
    // total_len off by one in each direction.
    for delta in [-1i32, 1] {
        let mut wire = encode(b"abcdef").unwrap();
        let total = u16::from_be_bytes([wire[0], wire[1]]);
        let bad = (i32::from(total) + delta) as u16;
        wire[..2].copy_from_slice(&bad.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&wire).unwrap_err();
        assert!(matches!(err, FramingError::LengthMismatch { .. }));
    }
}

#[test]
fn payload_length_boundary() {
    // 16384 accepted.
    let payload = vec![1u8; MAX_PAYLOAD_SIZE];
    let wire = encode(&payload).unwrap();
    let mut decoder = FrameDecoder::new();
    assert_eq!(decoder.feed(&wire).unwrap()[0].len(), MAX_PAYLOAD_SIZE);

    // 16385 rejected at decode before any payload byte is read.
    let total = (MAX_PAYLOAD_SIZE as u16 + 1).wrapping_add(6);
    let mut wire = Vec::new();
    wire.extend_from_slice(&total.to_be_bytes());
    wire.extend_from_slice(&0x5050u16.to_be_bytes());
    wire.extend_from_slice(&(MAX_PAYLOAD_SIZE as u16 + 1).to_be_bytes());

    let mut decoder = FrameDecoder::new();
    assert_eq!(
        decoder.feed(&wire),
        Err(FramingError::Oversized(MAX_PAYLOAD_SIZE + 1))
    );

    // Encoding an empty PPP payload is rejected outright.
    assert_eq!(encode(b""), Err(FramingError::EmptyPayload));
}
