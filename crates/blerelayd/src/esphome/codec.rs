//! Plaintext ESPHome native API framing.
//!
//! ```text
//! 0x00 | varint payload_len | varint msg_type | payload
//! ```
//!
//! The encrypted transport (preamble `0x01`) is not supported and is
//! reported as a protocol error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use blerelay_services::TransportError;

const PREAMBLE_PLAINTEXT: u8 = 0x00;
const PREAMBLE_NOISE: u8 = 0x01;
/// Upper bound on a single payload; real proxy messages stay far below it.
const MAX_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

/// Read a varint from the start of `buf` without consuming it.
/// Returns the value and its encoded length, or `None` if incomplete.
fn peek_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, TransportError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(TransportError::Protocol("varint too long".into()));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        let Some(&preamble) = src.first() else {
            return Ok(None);
        };
        match preamble {
            PREAMBLE_PLAINTEXT => {}
            PREAMBLE_NOISE => {
                return Err(TransportError::Rejected(
                    "proxy requires an encrypted connection".into(),
                ))
            }
            other => {
                return Err(TransportError::Protocol(format!("invalid preamble 0x{other:02x}")));
            }
        }

        let Some((len, len_size)) = peek_varint(&src[1..])? else {
            return Ok(None);
        };
        let Some((msg_type, type_size)) = peek_varint(&src[1 + len_size..])? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_PAYLOAD {
            return Err(TransportError::Protocol(format!("frame of {len} bytes exceeds limit")));
        }

        let header = 1 + len_size + type_size;
        if src.len() < header + len {
            src.reserve(header + len - src.len());
            return Ok(None);
        }

        src.advance(header);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            msg_type: msg_type as u32,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.reserve(frame.payload.len() + 11);
        dst.put_u8(PREAMBLE_PLAINTEXT);
        put_varint(dst, frame.payload.len() as u64);
        put_varint(dst, u64::from(frame.msg_type));
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_layout() {
        let buf = encoded(Frame::new(7, Bytes::new()));
        assert_eq!(&buf[..], &[0x00, 0x00, 0x07]);

        // 300-byte payload, type 93: both varints span two bytes.
        let buf = encoded(Frame::new(93, vec![0xAB; 300]));
        assert_eq!(&buf[..4], &[0x00, 0xAC, 0x02, 0x5D]);
        assert_eq!(buf.len(), 4 + 300);
    }

    #[test]
    fn decodes_across_partial_reads() {
        let wire = encoded(Frame::new(71, vec![1u8; 200]));
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();

        for chunk in wire.chunks(7) {
            assert!(buf.len() < wire.len());
            let before = buf.len();
            buf.extend_from_slice(chunk);
            if before + chunk.len() < wire.len() {
                assert_eq!(codec.decode(&mut buf).unwrap(), None);
            }
        }
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.msg_type, 71);
        assert_eq!(frame.payload.len(), 200);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = encoded(Frame::new(8, Bytes::new()));
        buf.extend_from_slice(&encoded(Frame::new(79, vec![9, 8, 7])));

        let mut codec = FrameCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::new(8, Bytes::new())));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::new(79, vec![9u8, 8, 7]))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_encrypted_and_garbage_preambles() {
        let mut codec = FrameCodec;
        let mut noise = BytesMut::from(&[0x01u8, 0x00, 0x00][..]);
        assert!(matches!(codec.decode(&mut noise), Err(TransportError::Rejected(_))));

        let mut garbage = BytesMut::from(&[0x42u8][..]);
        assert!(matches!(codec.decode(&mut garbage), Err(TransportError::Protocol(_))));
    }
}
