//! Typed wire messages.
//!
//! Each message is a tagged payload plus a correlation id. Id `0` means no
//! reply is expected; any other value ties a reply back to its request.
//! Payload layouts are big-endian and fixed per type; the frame around them
//! lives in `codec`.

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use quartz_core::{BLOCK_SIGNATURE_LENGTH, PUBLIC_KEY_LENGTH, TRANSACTION_SIGNATURE_LENGTH};

use crate::address::PeerAddress;
use crate::error::ProtocolError;

/// Length of a node's random identity in bytes.
pub const PEER_ID_LENGTH: usize = 128;

/// Length of a doppelganger verification code in bytes.
pub const VERIFICATION_CODE_LENGTH: usize = 32;

/// Length of the nonce inside a PROOF payload.
pub const PROOF_NONCE_LENGTH: usize = 32;

pub type PeerId = [u8; PEER_ID_LENGTH];
pub type VerificationCode = [u8; VERIFICATION_CODE_LENGTH];

/// The all-zero id no honest node ever presents.
pub const ZERO_PEER_ID: PeerId = [0u8; PEER_ID_LENGTH];

/// Recognised message types and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Version,
    PeerId,
    Proof,
    Peers,
    GetPeers,
    Height,
    Transaction,
    TransactionSignatures,
    GetUnconfirmedTransactions,
    PeerVerify,
    VerificationCodes,
    PeersV2,
    HeightV2,
    // Controller-level types the codec passes through by id.
    Block,
    GetBlock,
    Signatures,
    GetSignatures,
}

impl MessageType {
    pub fn code(self) -> u32 {
        match self {
            MessageType::Ping => 1,
            MessageType::Version => 2,
            MessageType::PeerId => 3,
            MessageType::Proof => 4,
            MessageType::Peers => 5,
            MessageType::GetPeers => 6,
            MessageType::Height => 7,
            MessageType::Transaction => 8,
            MessageType::TransactionSignatures => 9,
            MessageType::GetUnconfirmedTransactions => 10,
            MessageType::PeerVerify => 11,
            MessageType::VerificationCodes => 12,
            MessageType::PeersV2 => 13,
            MessageType::HeightV2 => 14,
            MessageType::Block => 20,
            MessageType::GetBlock => 21,
            MessageType::Signatures => 22,
            MessageType::GetSignatures => 23,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => MessageType::Ping,
            2 => MessageType::Version,
            3 => MessageType::PeerId,
            4 => MessageType::Proof,
            5 => MessageType::Peers,
            6 => MessageType::GetPeers,
            7 => MessageType::Height,
            8 => MessageType::Transaction,
            9 => MessageType::TransactionSignatures,
            10 => MessageType::GetUnconfirmedTransactions,
            11 => MessageType::PeerVerify,
            12 => MessageType::VerificationCodes,
            13 => MessageType::PeersV2,
            14 => MessageType::HeightV2,
            20 => MessageType::Block,
            21 => MessageType::GetBlock,
            22 => MessageType::Signatures,
            23 => MessageType::GetSignatures,
            _ => return None,
        })
    }

    /// Types the network layer does not interpret beyond the frame.
    pub fn is_opaque(self) -> bool {
        matches!(
            self,
            MessageType::Block
                | MessageType::GetBlock
                | MessageType::Signatures
                | MessageType::GetSignatures
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Ping => "PING",
            MessageType::Version => "VERSION",
            MessageType::PeerId => "PEER_ID",
            MessageType::Proof => "PROOF",
            MessageType::Peers => "PEERS",
            MessageType::GetPeers => "GET_PEERS",
            MessageType::Height => "HEIGHT",
            MessageType::Transaction => "TRANSACTION",
            MessageType::TransactionSignatures => "TRANSACTION_SIGNATURES",
            MessageType::GetUnconfirmedTransactions => "GET_UNCONFIRMED_TRANSACTIONS",
            MessageType::PeerVerify => "PEER_VERIFY",
            MessageType::VerificationCodes => "VERIFICATION_CODES",
            MessageType::PeersV2 => "PEERS_V2",
            MessageType::HeightV2 => "HEIGHT_V2",
            MessageType::Block => "BLOCK",
            MessageType::GetBlock => "GET_BLOCK",
            MessageType::Signatures => "SIGNATURES",
            MessageType::GetSignatures => "GET_SIGNATURES",
        };
        f.write_str(name)
    }
}

/// Message body, one variant per recognised type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ping,
    Version {
        version: u32,
    },
    PeerId(PeerId),
    /// Identity-binding proof: `digest = SHA-256(sender_peer_id || nonce)`.
    Proof {
        nonce: [u8; PROOF_NONCE_LENGTH],
        digest: [u8; 32],
    },
    /// Legacy peer gossip: IPv4 only, implied default port.
    Peers(Vec<Ipv4Addr>),
    /// Current peer gossip. `listen_port` is the sender's own listen port,
    /// carried on the wire as a first entry with an empty host.
    PeersV2 {
        listen_port: u16,
        peers: Vec<PeerAddress>,
    },
    GetPeers,
    Height {
        height: u32,
    },
    HeightV2 {
        height: u32,
        signature: Vec<u8>,
        timestamp: i64,
        minter_public_key: Vec<u8>,
    },
    /// Serialised transaction, opaque to this subsystem.
    Transaction(Vec<u8>),
    TransactionSignatures(Vec<[u8; TRANSACTION_SIGNATURE_LENGTH]>),
    GetUnconfirmedTransactions,
    PeerVerify(VerificationCode),
    VerificationCodes {
        code_sent: VerificationCode,
        code_expected: VerificationCode,
    },
    /// Controller-level message carried through untouched.
    Opaque {
        kind: MessageType,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Ping => MessageType::Ping,
            Payload::Version { .. } => MessageType::Version,
            Payload::PeerId(_) => MessageType::PeerId,
            Payload::Proof { .. } => MessageType::Proof,
            Payload::Peers(_) => MessageType::Peers,
            Payload::PeersV2 { .. } => MessageType::PeersV2,
            Payload::GetPeers => MessageType::GetPeers,
            Payload::Height { .. } => MessageType::Height,
            Payload::HeightV2 { .. } => MessageType::HeightV2,
            Payload::Transaction(_) => MessageType::Transaction,
            Payload::TransactionSignatures(_) => MessageType::TransactionSignatures,
            Payload::GetUnconfirmedTransactions => MessageType::GetUnconfirmedTransactions,
            Payload::PeerVerify(_) => MessageType::PeerVerify,
            Payload::VerificationCodes { .. } => MessageType::VerificationCodes,
            Payload::Opaque { kind, .. } => *kind,
        }
    }

    /// Serialise the body into `dst`.
    pub(crate) fn write(&self, dst: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Payload::Ping | Payload::GetPeers | Payload::GetUnconfirmedTransactions => {}
            Payload::Version { version } => dst.put_u32(*version),
            Payload::PeerId(id) => dst.put_slice(id),
            Payload::Proof { nonce, digest } => {
                dst.put_slice(nonce);
                dst.put_slice(digest);
            }
            Payload::Peers(addresses) => {
                dst.put_u32(addresses.len() as u32);
                for address in addresses {
                    dst.put_slice(&address.octets());
                }
            }
            Payload::PeersV2 { listen_port, peers } => {
                dst.put_u32(peers.len() as u32 + 1);
                // First entry: our listen port with an empty host.
                dst.put_u8(0);
                dst.put_u16(*listen_port);
                for peer in peers {
                    let host = peer.host().as_bytes();
                    if host.len() > u8::MAX as usize {
                        return Err(ProtocolError::EncodeFailed {
                            kind: MessageType::PeersV2,
                            detail: "host longer than 255 bytes",
                        });
                    }
                    dst.put_u8(host.len() as u8);
                    dst.put_slice(host);
                    dst.put_u16(peer.port());
                }
            }
            Payload::Height { height } => dst.put_u32(*height),
            Payload::HeightV2 {
                height,
                signature,
                timestamp,
                minter_public_key,
            } => {
                if signature.len() != BLOCK_SIGNATURE_LENGTH
                    || minter_public_key.len() != PUBLIC_KEY_LENGTH
                {
                    return Err(ProtocolError::EncodeFailed {
                        kind: MessageType::HeightV2,
                        detail: "bad signature or key length",
                    });
                }
                dst.put_u32(*height);
                dst.put_slice(signature);
                dst.put_i64(*timestamp);
                dst.put_slice(minter_public_key);
            }
            Payload::Transaction(data) => dst.put_slice(data),
            Payload::TransactionSignatures(signatures) => {
                dst.put_u32(signatures.len() as u32);
                for signature in signatures {
                    dst.put_slice(signature);
                }
            }
            Payload::PeerVerify(code) => dst.put_slice(code),
            Payload::VerificationCodes {
                code_sent,
                code_expected,
            } => {
                dst.put_slice(code_sent);
                dst.put_slice(code_expected);
            }
            Payload::Opaque { data, .. } => dst.put_slice(data),
        }
        Ok(())
    }

    /// Parse a body of the given type. The slice must contain exactly the
    /// payload; trailing bytes are a protocol violation.
    pub(crate) fn read(kind: MessageType, mut src: &[u8]) -> Result<Payload, ProtocolError> {
        let payload = match kind {
            MessageType::Ping => Payload::Ping,
            MessageType::GetPeers => Payload::GetPeers,
            MessageType::GetUnconfirmedTransactions => Payload::GetUnconfirmedTransactions,
            MessageType::Version => Payload::Version {
                version: take_u32(&mut src, kind)?,
            },
            MessageType::PeerId => Payload::PeerId(take_array(&mut src, kind)?),
            MessageType::Proof => Payload::Proof {
                nonce: take_array(&mut src, kind)?,
                digest: take_array(&mut src, kind)?,
            },
            MessageType::Peers => {
                let count = take_u32(&mut src, kind)? as usize;
                if src.remaining() != count * 4 {
                    return Err(ProtocolError::ShortRead(kind));
                }
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    let octets: [u8; 4] = take_array(&mut src, kind)?;
                    addresses.push(Ipv4Addr::from(octets));
                }
                Payload::Peers(addresses)
            }
            MessageType::PeersV2 => {
                let count = take_u32(&mut src, kind)? as usize;
                if count == 0 {
                    return Err(ProtocolError::BadPayload {
                        kind,
                        detail: "missing listen-port entry",
                    });
                }
                let (first_host, listen_port) = take_peer_entry(&mut src, kind)?;
                if !first_host.is_empty() {
                    return Err(ProtocolError::BadPayload {
                        kind,
                        detail: "first entry must have empty host",
                    });
                }
                let mut peers = Vec::with_capacity(count - 1);
                for _ in 1..count {
                    let (host, port) = take_peer_entry(&mut src, kind)?;
                    let peer = PeerAddress::new(host, port).map_err(|_| {
                        ProtocolError::BadPayload {
                            kind,
                            detail: "invalid peer entry",
                        }
                    })?;
                    peers.push(peer);
                }
                Payload::PeersV2 { listen_port, peers }
            }
            MessageType::Height => Payload::Height {
                height: take_u32(&mut src, kind)?,
            },
            MessageType::HeightV2 => {
                let height = take_u32(&mut src, kind)?;
                let signature = take_vec(&mut src, BLOCK_SIGNATURE_LENGTH, kind)?;
                let timestamp = take_i64(&mut src, kind)?;
                let minter_public_key = take_vec(&mut src, PUBLIC_KEY_LENGTH, kind)?;
                Payload::HeightV2 {
                    height,
                    signature,
                    timestamp,
                    minter_public_key,
                }
            }
            MessageType::Transaction => {
                let data = src.to_vec();
                src.advance(data.len());
                Payload::Transaction(data)
            }
            MessageType::TransactionSignatures => {
                let count = take_u32(&mut src, kind)? as usize;
                if src.remaining() != count * TRANSACTION_SIGNATURE_LENGTH {
                    return Err(ProtocolError::ShortRead(kind));
                }
                let mut signatures = Vec::with_capacity(count);
                for _ in 0..count {
                    signatures.push(take_array(&mut src, kind)?);
                }
                Payload::TransactionSignatures(signatures)
            }
            MessageType::PeerVerify => Payload::PeerVerify(take_array(&mut src, kind)?),
            MessageType::VerificationCodes => Payload::VerificationCodes {
                code_sent: take_array(&mut src, kind)?,
                code_expected: take_array(&mut src, kind)?,
            },
            kind if kind.is_opaque() => {
                return Ok(Payload::Opaque {
                    kind,
                    data: src.to_vec(),
                });
            }
            _ => unreachable!("all message types handled"),
        };

        if src.has_remaining() {
            return Err(ProtocolError::BadPayload {
                kind,
                detail: "trailing bytes",
            });
        }
        Ok(payload)
    }
}

/// A wire message: correlation id plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i32,
    pub payload: Payload,
}

impl Message {
    /// A message that expects no reply.
    pub fn new(payload: Payload) -> Self {
        Message { id: 0, payload }
    }

    pub fn with_id(id: i32, payload: Payload) -> Self {
        Message { id, payload }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn wants_reply(&self) -> bool {
        self.id != 0
    }
}

fn take_u32(src: &mut &[u8], kind: MessageType) -> Result<u32, ProtocolError> {
    if src.remaining() < 4 {
        return Err(ProtocolError::ShortRead(kind));
    }
    Ok(src.get_u32())
}

fn take_i64(src: &mut &[u8], kind: MessageType) -> Result<i64, ProtocolError> {
    if src.remaining() < 8 {
        return Err(ProtocolError::ShortRead(kind));
    }
    Ok(src.get_i64())
}

fn take_array<const N: usize>(src: &mut &[u8], kind: MessageType) -> Result<[u8; N], ProtocolError> {
    if src.remaining() < N {
        return Err(ProtocolError::ShortRead(kind));
    }
    let mut out = [0u8; N];
    src.copy_to_slice(&mut out);
    Ok(out)
}

fn take_vec(src: &mut &[u8], len: usize, kind: MessageType) -> Result<Vec<u8>, ProtocolError> {
    if src.remaining() < len {
        return Err(ProtocolError::ShortRead(kind));
    }
    let mut out = vec![0u8; len];
    src.copy_to_slice(&mut out);
    Ok(out)
}

fn take_peer_entry(src: &mut &[u8], kind: MessageType) -> Result<(String, u16), ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::ShortRead(kind));
    }
    let host_len = src.get_u8() as usize;
    if src.remaining() < host_len + 2 {
        return Err(ProtocolError::ShortRead(kind));
    }
    let mut host = vec![0u8; host_len];
    src.copy_to_slice(&mut host);
    let host = String::from_utf8(host).map_err(|_| ProtocolError::BadPayload {
        kind,
        detail: "host is not utf-8",
    })?;
    let port = src.get_u16();
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) -> Payload {
        let kind = payload.message_type();
        let mut buffer = Vec::new();
        payload.write(&mut buffer).unwrap();
        Payload::read(kind, &buffer).unwrap()
    }

    #[test]
    fn test_version_roundtrip() {
        assert_eq!(
            roundtrip(Payload::Version { version: 2 }),
            Payload::Version { version: 2 }
        );
    }

    #[test]
    fn test_peers_v2_roundtrip_carries_listen_port() {
        let peers = vec![
            PeerAddress::parse("203.0.113.7:4444", 10392).unwrap(),
            PeerAddress::parse("[2001:db8::1]:5555", 10392).unwrap(),
            PeerAddress::parse("node1.quartz.network", 10392).unwrap(),
        ];
        let payload = Payload::PeersV2 {
            listen_port: 10392,
            peers: peers.clone(),
        };
        match roundtrip(payload) {
            Payload::PeersV2 {
                listen_port,
                peers: decoded,
            } => {
                assert_eq!(listen_port, 10392);
                assert_eq!(decoded, peers);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn test_peers_v2_rejects_nonempty_first_host() {
        let mut buffer = Vec::new();
        buffer.put_u32(1);
        buffer.put_u8(4);
        buffer.put_slice(b"evil");
        buffer.put_u16(9999);
        assert!(matches!(
            Payload::read(MessageType::PeersV2, &buffer),
            Err(ProtocolError::BadPayload { .. })
        ));
    }

    #[test]
    fn test_height_v2_roundtrip() {
        let payload = Payload::HeightV2 {
            height: 123_456,
            signature: vec![0x11; BLOCK_SIGNATURE_LENGTH],
            timestamp: 1_700_000_000_000,
            minter_public_key: vec![0x22; PUBLIC_KEY_LENGTH],
        };
        assert_eq!(roundtrip(payload.clone()), payload);
    }

    #[test]
    fn test_transaction_roundtrip() {
        let payload = Payload::Transaction(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(roundtrip(payload.clone()), payload);
    }

    #[test]
    fn test_transaction_signatures_roundtrip() {
        let payload = Payload::TransactionSignatures(vec![[7u8; 64], [9u8; 64]]);
        assert_eq!(roundtrip(payload.clone()), payload);
    }

    #[test]
    fn test_truncated_peer_id_is_short_read() {
        let buffer = vec![0u8; PEER_ID_LENGTH - 1];
        assert!(matches!(
            Payload::read(MessageType::PeerId, &buffer),
            Err(ProtocolError::ShortRead(MessageType::PeerId))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buffer = Vec::new();
        Payload::Version { version: 2 }.write(&mut buffer).unwrap();
        buffer.push(0xff);
        assert!(matches!(
            Payload::read(MessageType::Version, &buffer),
            Err(ProtocolError::BadPayload { .. })
        ));
    }

    #[test]
    fn test_opaque_passthrough() {
        let payload = Payload::Opaque {
            kind: MessageType::Block,
            data: vec![1, 2, 3, 4],
        };
        assert_eq!(roundtrip(payload.clone()), payload);
    }

    #[test]
    fn test_type_codes_roundtrip() {
        for kind in [
            MessageType::Ping,
            MessageType::Version,
            MessageType::PeerId,
            MessageType::Proof,
            MessageType::Peers,
            MessageType::GetPeers,
            MessageType::Height,
            MessageType::Transaction,
            MessageType::TransactionSignatures,
            MessageType::GetUnconfirmedTransactions,
            MessageType::PeerVerify,
            MessageType::VerificationCodes,
            MessageType::PeersV2,
            MessageType::HeightV2,
            MessageType::Block,
            MessageType::GetBlock,
            MessageType::Signatures,
            MessageType::GetSignatures,
        ] {
            assert_eq!(MessageType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageType::from_code(9999), None);
    }
}
