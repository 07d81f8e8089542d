// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fortinet framing codec for PPP over the TLS byte stream.
//!
//! After tunnel promotion the Fortigate wraps every PPP packet in a
//! 6-byte header:
//!
//! ```text
//! +----------------+------------+-----------------+-----------------+
//! | total_len (BE) | 0x50 0x50  | payload_len (BE)| payload         |
//! +----------------+------------+-----------------+-----------------+
//! ```
//!
//! with `total_len == payload_len + 6` and `payload_len <= 16384`.
//!
//! The decoder maintains partial-read state to handle the streaming
//! nature of TLS. Unlike PPP-over-serial there is no flag byte to hunt
//! for, so a framing violation is unrecoverable: the decoder reports a
//! fatal error and stays poisoned until the session is torn down.
//!
//! # Example
//!
//! ```
//! use fortitun::ppp::frame::{encode, FrameDecoder};
//!
//! let frame = encode(b"\xff\x03\xc0\x21").unwrap();
//! assert_eq!(&frame[..6], &[0x00, 0x0A, 0x50, 0x50, 0x00, 0x04]);
//!
//! let mut decoder = FrameDecoder::new();
//! let payloads = decoder.feed(&frame).unwrap();
//! assert_eq!(payloads, vec![b"\xff\x03\xc0\x21".to_vec()]);
//! ```

use std::fmt;

/// Frame header size: total_len + magic + payload_len, 2 bytes each.
pub const FRAME_HEADER_SIZE: usize = 6;

/// The magic half-word present in every frame.
pub const FRAME_MAGIC: u16 = 0x5050;

/// Largest payload the Fortigate accepts or emits.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Fatal framing violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// The magic half-word was not 0x5050.
    BadMagic(u16),

    /// `total_len` disagreed with `payload_len + 6`.
    LengthMismatch {
        /// Received total length.
        total: u16,
        /// Received payload length.
        payload: u16,
    },

    /// Payload length above [`MAX_PAYLOAD_SIZE`].
    Oversized(usize),

    /// Attempt to encode an empty PPP payload (no valid empty frame
    /// exists).
    EmptyPayload,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(magic) => write!(f, "bad frame magic 0x{:04x}", magic),
            Self::LengthMismatch { total, payload } => write!(
                f,
                "inconsistent frame lengths: total={} payload={}",
                total, payload
            ),
            Self::Oversized(len) => write!(f, "frame payload too large: {} bytes", len),
            Self::EmptyPayload => write!(f, "empty ppp payload"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Encode one PPP packet into a framed buffer.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    encode_into(payload, &mut frame)?;
    Ok(frame)
}

/// Encode one PPP packet, appending to an existing buffer.
pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) -> Result<(), FramingError> {
    if payload.is_empty() {
        return Err(FramingError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FramingError::Oversized(payload.len()));
    }

    let total = (payload.len() + FRAME_HEADER_SIZE) as u16;
    buf.extend_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Internal state for incremental decoding.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Accumulating the 6-byte header.
    ReadingHeader { bytes_read: usize },

    /// Accumulating the payload.
    ReadingPayload {
        payload_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingHeader { bytes_read: 0 }
    }
}

/// Incremental Fortinet frame decoder.
///
/// Feed decrypted carrier bytes in; complete PPP payloads come out. Any
/// violation poisons the decoder permanently (the caller must tear the
/// session down).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: ReadState,

    /// Header accumulation buffer.
    header: [u8; FRAME_HEADER_SIZE],

    /// Payload accumulation buffer.
    payload: Vec<u8>,

    /// Set once a violation was seen; all further feeds fail.
    poisoned: Option<FramingError>,

    frames_decoded: u64,
    bytes_decoded: u64,
}

impl FrameDecoder {
    /// Create a decoder at the start-of-header state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of complete frames decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Total payload bytes decoded so far.
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// True when the decoder is mid-frame.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingHeader { bytes_read } => bytes_read > 0,
            ReadState::ReadingPayload { .. } => true,
        }
    }

    /// Bytes needed to complete the current header or payload.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            ReadState::ReadingHeader { bytes_read } => FRAME_HEADER_SIZE - bytes_read,
            ReadState::ReadingPayload {
                payload_len,
                bytes_read,
            } => payload_len - bytes_read,
        }
    }

    /// Consume carrier bytes, returning every complete payload.
    ///
    /// On a violation no payload bytes are delivered and every later call
    /// reports the same error.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        if let Some(err) = self.poisoned {
            return Err(err);
        }

        let mut out = Vec::new();

        while !data.is_empty() {
            match self.state {
                ReadState::ReadingHeader { bytes_read } => {
                    let needed = FRAME_HEADER_SIZE - bytes_read;
                    let take = needed.min(data.len());
                    self.header[bytes_read..bytes_read + take].copy_from_slice(&data[..take]);
                    data = &data[take..];

                    if take < needed {
                        self.state = ReadState::ReadingHeader {
                            bytes_read: bytes_read + take,
                        };
                        continue;
                    }

                    // Header complete; validate before touching the payload.
                    let total = u16::from_be_bytes([self.header[0], self.header[1]]);
                    let magic = u16::from_be_bytes([self.header[2], self.header[3]]);
                    let payload_len = u16::from_be_bytes([self.header[4], self.header[5]]);

                    if magic != FRAME_MAGIC {
                        return Err(self.poison(FramingError::BadMagic(magic)));
                    }
                    if usize::from(payload_len) > MAX_PAYLOAD_SIZE {
                        return Err(self.poison(FramingError::Oversized(payload_len.into())));
                    }
                    if u32::from(total)
                        != u32::from(payload_len) + FRAME_HEADER_SIZE as u32
                    {
                        return Err(self.poison(FramingError::LengthMismatch {
                            total,
                            payload: payload_len,
                        }));
                    }

                    self.payload = Vec::with_capacity(payload_len.into());
                    self.state = ReadState::ReadingPayload {
                        payload_len: payload_len.into(),
                        bytes_read: 0,
                    };
                }

                ReadState::ReadingPayload {
                    payload_len,
                    bytes_read,
                } => {
                    let needed = payload_len - bytes_read;
                    let take = needed.min(data.len());
                    self.payload.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if take < needed {
                        self.state = ReadState::ReadingPayload {
                            payload_len,
                            bytes_read: bytes_read + take,
                        };
                        continue;
                    }

                    self.frames_decoded += 1;
                    self.bytes_decoded += payload_len as u64;
                    out.push(std::mem::take(&mut self.payload));
                    self.state = ReadState::default();
                }
            }
        }

        Ok(out)
    }

    fn poison(&mut self, err: FramingError) -> FramingError {
        self.poisoned = Some(err);
        err
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(b"abc").unwrap();
        assert_eq!(frame, vec![0x00, 0x09, 0x50, 0x50, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_rejects_empty() {
        assert_eq!(encode(b""), Err(FramingError::EmptyPayload));
    }

    #[test]
    fn test_encode_boundary_sizes() {
        let max = vec![0u8; MAX_PAYLOAD_SIZE];
        assert!(encode(&max).is_ok());

        let over = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(encode(&over), Err(FramingError::Oversized(MAX_PAYLOAD_SIZE + 1)));
    }

    #[test]
    fn test_decode_roundtrip() {
        let payload = b"\xff\x03\x00\x21hello".to_vec();
        let frame = encode(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        let out = decoder.feed(&frame).unwrap();
        assert_eq!(out, vec![payload]);
        assert_eq!(decoder.frames_decoded(), 1);
        assert_eq!(decoder.bytes_decoded(), 9);
    }

    #[test]
    fn test_decode_with_trailing_suffix() {
        // A frame followed by the prefix of the next one decodes the first
        // payload identically.
        let payload = b"data".to_vec();
        let mut wire = encode(&payload).unwrap();
        wire.extend_from_slice(&[0x00, 0x0B]); // start of the next header

        let mut decoder = FrameDecoder::new();
        let out = decoder.feed(&wire).unwrap();
        assert_eq!(out, vec![payload]);
        assert!(decoder.is_partial());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let payload = b"fragmented".to_vec();
        let frame = encode(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for byte in &frame {
            out.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(out, vec![payload]);
    }

    #[test]
    fn test_decode_multiple_frames_one_feed() {
        let mut wire = Vec::new();
        encode_into(b"one", &mut wire).unwrap();
        encode_into(b"two", &mut wire).unwrap();
        encode_into(b"three", &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let out = decoder.feed(&wire).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], b"three");
        assert_eq!(decoder.frames_decoded(), 3);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut wire = encode(b"x").unwrap();
        wire[2] = 0x51;

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&wire), Err(FramingError::BadMagic(0x5150)));

        // Poisoned: a later, well-formed frame is still rejected.
        let good = encode(b"y").unwrap();
        assert!(decoder.feed(&good).is_err());
        assert_eq!(decoder.frames_decoded(), 0);
    }

    #[test]
    fn test_length_mismatch_is_fatal() {
        let mut wire = encode(b"abcd").unwrap();
        wire[1] = wire[1].wrapping_add(1); // total_len now payload_len + 7

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&wire).unwrap_err();
        assert!(matches!(err, FramingError::LengthMismatch { .. }));
    }

    #[test]
    fn test_oversized_payload_rejected_at_decode() {
        // payload_len = 16385 with a consistent total_len.
        let total = (16385u32 + 6) as u16;
        let mut wire = Vec::new();
        wire.extend_from_slice(&total.to_be_bytes());
        wire.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        wire.extend_from_slice(&16385u16.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&wire), Err(FramingError::Oversized(16385)));
    }

    #[test]
    fn test_max_payload_accepted_at_decode() {
        let payload = vec![0xABu8; MAX_PAYLOAD_SIZE];
        let frame = encode(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        let out = decoder.feed(&frame).unwrap();
        assert_eq!(out[0].len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_bytes_needed_tracking() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.bytes_needed(), FRAME_HEADER_SIZE);
        assert!(!decoder.is_partial());

        let frame = encode(b"abcdef").unwrap();
        decoder.feed(&frame[..2]).unwrap();
        assert_eq!(decoder.bytes_needed(), 4);
        assert!(decoder.is_partial());

        decoder.feed(&frame[2..8]).unwrap();
        assert_eq!(decoder.bytes_needed(), 4); // 6-byte payload, 2 read
    }
}
