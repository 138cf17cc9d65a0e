//! Datagram framing for the wire transport
//!
//! Every UDP datagram carries exactly one frame:
//! - 1 byte: protocol version
//! - 1 byte: frame type
//! - N bytes: payload (the rest of the datagram)

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame that fits one UDP datagram
pub const MAX_FRAME_SIZE: usize = 65_507;

const HEADER_SIZE: usize = 2;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Signed presence announcement, sent in the clear
    Beacon = 1,
    /// Session handshake initiation
    Hello = 2,
    /// Session handshake response
    Key = 3,
    /// Encrypted session data
    Data = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Beacon),
            2 => Ok(Self::Hello),
            3 => Ok(Self::Key),
            4 => Ok(Self::Data),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Encoded size on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Codec for single-datagram frames
///
/// `decode` consumes the whole buffer; each call is handed one datagram.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < HEADER_SIZE {
            let len = src.len();
            src.clear();
            return Err(FrameError::Truncated(len));
        }
        if src.len() > MAX_FRAME_SIZE {
            let len = src.len();
            src.clear();
            return Err(FrameError::TooLarge(len));
        }

        let version = src.get_u8();
        if version != PROTOCOL_VERSION {
            src.clear();
            return Err(FrameError::UnsupportedVersion(version));
        }

        let type_byte = src.get_u8();
        let frame_type = match FrameType::try_from(type_byte) {
            Ok(frame_type) => frame_type,
            Err(e) => {
                src.clear();
                return Err(e);
            }
        };

        let payload = src.split().to_vec();
        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.wire_len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(length);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(FrameType::Data, vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..2], &[PROTOCOL_VERSION, 4]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(FrameType::Beacon, vec![]), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_datagrams() {
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::from(&[PROTOCOL_VERSION][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::Truncated(1))));

        let mut buf = BytesMut::from(&[9u8, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::UnsupportedVersion(9))
        ));
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&[PROTOCOL_VERSION, 77][..]);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::UnknownType(77))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::new(FrameType::Data, vec![0; MAX_FRAME_SIZE]);
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(FrameError::TooLarge(_))
        ));
    }
}
