//! Network error types using thiserror for consistent error handling.

use std::io;

use thiserror::Error;

use crate::message::MessageType;
use crate::repository::RepositoryError;

/// Frame-level failures while decoding or encoding wire messages.
///
/// A truly short *frame* is not an error: the decoder returns "not yet" and
/// resumes when more bytes arrive. `ShortRead` refers to a payload whose
/// declared length does not contain all of its fields.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("declared payload of {declared} bytes exceeds limit of {limit}")]
    Oversize { declared: usize, limit: usize },

    #[error("truncated {0} payload")]
    ShortRead(MessageType),

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("malformed {kind} payload: {detail}")]
    BadPayload {
        kind: MessageType,
        detail: &'static str,
    },

    #[error("failed to encode {0} message: {detail}")]
    EncodeFailed {
        kind: MessageType,
        detail: &'static str,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Why a handshake transition was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unexpected {got} message in {state} state")]
    Unexpected { state: &'static str, got: MessageType },

    #[error("identity proof mismatch")]
    ProofMismatch,

    #[error("peer id not established before proof")]
    MissingPeerId,
}

/// Top-level error for network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("peer disconnected")]
    Disconnected,

    #[error(transparent)]
    Persistence(#[from] RepositoryError),

    #[error("network is shutting down")]
    Shutdown,
}

/// Result type alias for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
