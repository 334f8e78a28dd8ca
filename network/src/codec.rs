//! Wire framing.
//!
//! Frame layout, all integers big-endian:
//!
//! | field    | size | notes                                        |
//! |----------|------|----------------------------------------------|
//! | magic    | 4    | network tag, mainnet `51 4F 52 54`           |
//! | type     | 4    | message type code                            |
//! | id       | 4    | `0` = no reply expected                      |
//! | length   | 4    | payload size in bytes                        |
//! | checksum | 4    | first 4 bytes of SHA-256, only if length > 0 |
//! | payload  | len  | type-specific body                           |
//!
//! The decoder is resumable: fed a partial frame it returns `None` and picks
//! up where it left off once more bytes arrive. An oversize declaration is
//! rejected from the header alone, before any payload allocation.

use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Message, MessageType, Payload};

/// Mainnet message magic.
pub const MAINNET_MAGIC: [u8; 4] = [0x51, 0x4f, 0x52, 0x54];

/// Testnet message magic.
pub const TESTNET_MAGIC: [u8; 4] = [0x71, 0x6f, 0x72, 0x54];

const HEADER_LENGTH: usize = 16;
const CHECKSUM_LENGTH: usize = 4;

/// Frames and unframes messages for one connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    magic: [u8; 4],
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(magic: [u8; 4], max_message_size: usize) -> Self {
        FrameCodec {
            magic,
            max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let digest = Sha256::digest(payload);
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&digest[..CHECKSUM_LENGTH]);
    out
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        if src[..4] != self.magic {
            return Err(ProtocolError::BadMagic);
        }

        let type_code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let kind =
            MessageType::from_code(type_code).ok_or(ProtocolError::UnknownType(type_code))?;
        let id = i32::from_be_bytes([src[8], src[9], src[10], src[11]]);
        let length = u32::from_be_bytes([src[12], src[13], src[14], src[15]]) as usize;

        // Checked from the header alone, before any buffering of the body.
        if length > self.max_message_size {
            return Err(ProtocolError::Oversize {
                declared: length,
                limit: self.max_message_size,
            });
        }

        let payload = if length == 0 {
            src.advance(HEADER_LENGTH);
            Payload::read(kind, &[])?
        } else {
            let total = HEADER_LENGTH + CHECKSUM_LENGTH + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let expected: [u8; CHECKSUM_LENGTH] = [src[16], src[17], src[18], src[19]];
            let body = &src[HEADER_LENGTH + CHECKSUM_LENGTH..total];
            if checksum(body) != expected {
                return Err(ProtocolError::BadChecksum);
            }

            let payload = Payload::read(kind, body)?;
            src.advance(total);
            payload
        };

        Ok(Some(Message::with_id(id, payload)))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let kind = message.message_type();

        let mut body = Vec::new();
        message.payload.write(&mut body)?;
        if body.len() > self.max_message_size {
            return Err(ProtocolError::EncodeFailed {
                kind,
                detail: "payload exceeds maximum message size",
            });
        }

        dst.reserve(HEADER_LENGTH + CHECKSUM_LENGTH + body.len());
        dst.put_slice(&self.magic);
        dst.put_u32(kind.code());
        dst.put_i32(message.id);
        dst.put_u32(body.len() as u32);
        if !body.is_empty() {
            dst.put_slice(&checksum(&body));
            dst.put_slice(&body);
        }
        Ok(())
    }
}
