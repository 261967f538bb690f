//! Protocol codec for encoding/decoding envelopes
//!
//! Handles serialization and framing of envelopes on a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::{Envelope, DEFAULT_MAX_MESSAGE_SIZE, MAGIC_BYTES};

/// Header size: magic(4) + length(4) + sequence(4) = 12 bytes
const HEADER_SIZE: usize = 12;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Message type must not be empty")]
    EmptyMessageType,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Envelope frame with metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number assigned by the sending side
    pub sequence: u32,
    /// The decoded envelope
    pub envelope: Envelope,
}

impl Frame {
    pub fn new(sequence: u32, envelope: Envelope) -> Self {
        Self { sequence, envelope }
    }
}

/// Encodes envelopes into the wire format
pub struct Encoder {
    sequence: u32,
    max_message_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            sequence: 0,
            max_message_size,
        }
    }

    /// Encode an envelope into a buffer
    pub fn encode(&mut self, envelope: &Envelope, buf: &mut BytesMut) -> Result<(), CodecError> {
        if envelope.message_type().is_empty() {
            return Err(CodecError::EmptyMessageType);
        }

        let body = bincode::serialize(envelope)?;

        if body.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge(body.len(), self.max_message_size));
        }

        buf.reserve(HEADER_SIZE + body.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(body.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&body);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes envelopes from the wire format
pub struct Decoder {
    state: DecodeState,
    max_message_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Body {
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_message_size,
        }
    }

    /// True when no partially decoded frame is pending
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                    let sequence = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

                    if length > self.max_message_size {
                        return Err(CodecError::MessageTooLarge(length, self.max_message_size));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Body { length, sequence };
                }
                DecodeState::Body { length, sequence } => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }

                    let body = buf.split_to(length);
                    self.state = DecodeState::Header;

                    let envelope: Envelope = bincode::deserialize(&body)?;
                    if envelope.message_type().is_empty() {
                        return Err(CodecError::EmptyMessageType);
                    }

                    return Ok(Some(Frame::new(sequence, envelope)));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let original = Envelope::with_value("greet", "hi").unwrap();
        encoder.encode(&original, &mut buf).unwrap();

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.envelope, original);
        assert_eq!(frame.envelope.payload().decode::<String>().unwrap(), "hi");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_envelopes() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let envelopes = vec![
            Envelope::with_value("tick", &42u64).unwrap(),
            Envelope::new("raw", Payload::from_bytes(vec![1u8, 2, 3])).unwrap(),
            Envelope::with_value("pair", &(-1i32, "x".to_string())).unwrap(),
        ];

        for envelope in &envelopes {
            encoder.encode(envelope, &mut buf).unwrap();
        }

        for (i, original) in envelopes.iter().enumerate() {
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.sequence, i as u32);
            assert_eq!(&frame.envelope, original);
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut full = BytesMut::new();
        encoder
            .encode(&Envelope::with_value("greet", "hello there").unwrap(), &mut full)
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_idle());

        buf.extend_from_slice(&full[5..HEADER_SIZE + 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(!decoder.is_idle());

        buf.extend_from_slice(&full[HEADER_SIZE + 2..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.envelope.message_type(), "greet");
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_invalid_magic() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"NOPE\0\0\0\0\0\0\0\0"[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(CodecError::InvalidMagic)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut encoder = Encoder::new();
        let mut buf = BytesMut::new();
        encoder
            .encode(&Envelope::new("blob", Payload::from_bytes(vec![7u8; 256])).unwrap(), &mut buf)
            .unwrap();

        let mut decoder = Decoder::with_max_message_size(64);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::MessageTooLarge(_, 64))
        ));

        let mut small = Encoder::with_max_message_size(64);
        let result = small.encode(
            &Envelope::new("blob", Payload::from_bytes(vec![7u8; 256])).unwrap(),
            &mut BytesMut::new(),
        );
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_, 64))));
    }

    #[test]
    fn test_empty_type_on_wire_rejected() {
        #[derive(serde::Serialize)]
        struct RawEnvelope {
            message_type: String,
            payload: Payload,
        }

        let body = bincode::serialize(&RawEnvelope {
            message_type: String::new(),
            payload: Payload::default(),
        })
        .unwrap();

        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(body.len() as u32);
        buf.put_u32(0);
        buf.put_slice(&body);

        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::EmptyMessageType)
        ));
    }
}
