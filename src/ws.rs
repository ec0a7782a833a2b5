//! WebSocket Codec (C7): a minimal hand-rolled RFC 6455 frame codec for the
//! built-in control channels, implemented as a `tokio_util::codec::
//! {Decoder,Encoder}` pair rather than pulling in a WebSocket crate (§1
//! explicitly scopes this component as "from scratch").

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_byte(b: u8) -> Option<Opcode> {
        match b {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn close() -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Close,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("reserved bits must be zero")]
    ReservedBitsSet,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("control frame too large or fragmented")]
    InvalidControlFrame,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes/decodes frames for one side of a connection. `mask` is `true` for
/// frames originating as a client (the downstream tunnel side dialing an
/// external WebSocket server, §4.6's "open a raw TCP tunnel and shuttle
/// frames"); server→client frames (the built-in channels talking to the
/// browser) are sent unmasked per §4.7.
pub struct WsCodec {
    pub mask: bool,
}

impl WsCodec {
    pub fn server() -> WsCodec {
        WsCodec { mask: false }
    }

    pub fn client() -> WsCodec {
        WsCodec { mask: true }
    }
}

impl Encoder<Frame> for WsCodec {
    type Error = WsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WsError> {
        let len = frame.payload.len();

        let mut byte0 = frame.opcode.to_byte();
        if frame.fin {
            byte0 |= 0x80;
        }
        dst.put_u8(byte0);

        let mask_bit = if self.mask { 0x80 } else { 0x00 };
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if self.mask {
            let mut key = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut key);
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            for (i, byte) in dst[start..].iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

impl Decoder for WsCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let byte0 = src[0];
        let byte1 = src[1];

        if byte0 & 0x70 != 0 {
            return Err(WsError::ReservedBitsSet);
        }

        let fin = byte0 & 0x80 != 0;
        let opcode = Opcode::from_byte(byte0 & 0x0F).ok_or(WsError::UnknownOpcode(byte0 & 0x0F))?;
        let masked = byte1 & 0x80 != 0;
        let len_indicator = byte1 & 0x7F;

        if opcode.is_control() && (!fin || len_indicator > 125) {
            return Err(WsError::InvalidControlFrame);
        }

        let mut offset = 2usize;
        let payload_len: usize = match len_indicator {
            126 => {
                if src.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([src[offset], src[offset + 1]]) as usize;
                offset += 2;
                len
            }
            127 => {
                if src.len() < offset + 8 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&src[offset..offset + 8]);
                offset += 8;
                u64::from_be_bytes(bytes) as usize
            }
            n => n as usize,
        };

        let mask_key = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < offset + payload_len {
            src.reserve(offset + payload_len - src.len());
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(payload_len);

        if let Some(key) = mask_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

/// Reassembles a sequence of possibly-continued frames into complete
/// messages (§4.7: "assemble continuation frames until FIN"). Control
/// frames interleaved between continuation frames are returned immediately
/// and do not reset the in-progress message buffer.
#[derive(Default)]
pub struct MessageAssembler {
    pending_opcode: Option<Opcode>,
    pending_payload: BytesMut,
}

pub enum Assembled {
    Message { opcode: Opcode, payload: Bytes },
    Control(Frame),
    Incomplete,
}

impl MessageAssembler {
    pub fn push(&mut self, frame: Frame) -> Assembled {
        if frame.opcode.is_control() {
            return Assembled::Control(frame);
        }

        match (self.pending_opcode, frame.opcode) {
            (None, Opcode::Continuation) => Assembled::Incomplete,
            (None, opcode) => {
                self.pending_opcode = Some(opcode);
                self.pending_payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    let opcode = self.pending_opcode.take().unwrap();
                    let payload = std::mem::take(&mut self.pending_payload).freeze();
                    Assembled::Message { opcode, payload }
                } else {
                    Assembled::Incomplete
                }
            }
            (Some(_), Opcode::Continuation) => {
                self.pending_payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    let opcode = self.pending_opcode.take().unwrap();
                    let payload = std::mem::take(&mut self.pending_payload).freeze();
                    Assembled::Message { opcode, payload }
                } else {
                    Assembled::Incomplete
                }
            }
            (Some(_), _) => Assembled::Incomplete,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn encode_large_client_text_frame_matches_rfc_header_prefix() {
        let payload = vec![b'x'; 123278];
        let frame = Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: Bytes::from(payload),
        };
        let mut codec = WsCodec::client();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        assert_eq!(
            &buf[0..10],
            &[0x81, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xE1, 0x8E]
        );
    }

    #[test]
    pub fn server_frames_are_not_masked() {
        let frame = Frame::text(Bytes::from_static(b"hi"));
        let mut codec = WsCodec::server();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x02); // no mask bit, length 2
        assert_eq!(&buf[2..4], b"hi");
    }

    #[test]
    pub fn small_frame_round_trips_through_encode_and_decode() {
        let frame = Frame::text(Bytes::from_static(b"hello world"));
        let mut encoder = WsCodec::client();
        let mut buf = BytesMut::new();
        encoder.encode(frame.clone(), &mut buf).unwrap();

        let mut decoder = WsCodec::client();
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode, Opcode::Text);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.fin, true);
    }

    #[test]
    pub fn decode_returns_none_on_partial_frame() {
        let mut decoder = WsCodec::server();
        let mut buf = BytesMut::from(&[0x81u8][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    pub fn reserved_bits_are_rejected() {
        let mut decoder = WsCodec::server();
        let mut buf = BytesMut::from(&[0xB1u8, 0x00][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WsError::ReservedBitsSet)));
    }

    #[test]
    pub fn fragmented_message_is_assembled_on_final_continuation() {
        let mut assembler = MessageAssembler::default();
        let first = Frame {
            fin: false,
            opcode: Opcode::Text,
            payload: Bytes::from_static(b"hel"),
        };
        let second = Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: Bytes::from_static(b"lo"),
        };

        assert!(matches!(assembler.push(first), Assembled::Incomplete));
        match assembler.push(second) {
            Assembled::Message { opcode, payload } => {
                assert_eq!(opcode, Opcode::Text);
                assert_eq!(payload, Bytes::from_static(b"hello"));
            }
            _ => panic!("expected assembled message"),
        }
    }

    #[test]
    pub fn control_frame_between_continuations_does_not_reset_buffer() {
        let mut assembler = MessageAssembler::default();
        let first = Frame {
            fin: false,
            opcode: Opcode::Text,
            payload: Bytes::from_static(b"hel"),
        };
        assert!(matches!(assembler.push(first), Assembled::Incomplete));

        let ping = Frame {
            fin: true,
            opcode: Opcode::Ping,
            payload: Bytes::new(),
        };
        assert!(matches!(assembler.push(ping), Assembled::Control(_)));

        let second = Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: Bytes::from_static(b"lo"),
        };
        match assembler.push(second) {
            Assembled::Message { payload, .. } => assert_eq!(payload, Bytes::from_static(b"hello")),
            _ => panic!("expected assembled message"),
        }
    }
}
