//! Handshake state machine.
//!
//! A fresh connection exchanges, in order: VERSION, PEER_ID, PROOF. The
//! outbound side drives every step (sends before waiting); the inbound side
//! answers in kind. This asymmetry keeps the two directions from crossing
//! messages mid-handshake.
//!
//! Each transition is a pure function of `(state, direction, env, message)`
//! returning the next state plus a list of actions for the manager to carry
//! out. Nothing in this module touches sockets or locks.

use sha2::{Digest, Sha256};

use crate::error::HandshakeError;
use crate::message::{
    Message, MessageType, Payload, PeerId, PROOF_NONCE_LENGTH, ZERO_PEER_ID,
};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

/// Handshake progress for one connection. The state is named after the
/// message it is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Started,
    Version,
    PeerId,
    Proof,
    PeerVerify,
    Completed,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Started => "STARTED",
            HandshakeState::Version => "VERSION",
            HandshakeState::PeerId => "PEER_ID",
            HandshakeState::Proof => "PROOF",
            HandshakeState::PeerVerify => "PEER_VERIFY",
            HandshakeState::Completed => "COMPLETED",
        }
    }

    /// The message type acceptable in this state, if any.
    pub fn expected_message(self) -> Option<MessageType> {
        match self {
            HandshakeState::Started | HandshakeState::Version => Some(MessageType::Version),
            HandshakeState::PeerId => Some(MessageType::PeerId),
            HandshakeState::Proof => Some(MessageType::Proof),
            HandshakeState::PeerVerify => Some(MessageType::PeerVerify),
            HandshakeState::Completed => None,
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, HandshakeState::Completed)
    }
}

/// Everything a transition may read. Assembled by the manager from peer and
/// network state; the transition itself stays pure.
pub struct HandshakeEnv {
    pub our_peer_id: PeerId,
    pub our_version: u32,
    /// Nonce this side uses in its own PROOF, fixed per connection.
    pub our_proof_nonce: [u8; PROOF_NONCE_LENGTH],
    /// Remote id recorded at the PEER_ID step, pending or adopted.
    pub remote_peer_id: Option<PeerId>,
    /// True when an existing inbound connection already claims the id just
    /// presented on this outbound connection. Read at the PEER_ID step.
    pub inbound_claims_id: bool,
    /// True when this connection holds a pending doppelganger id. Read at
    /// the PROOF step.
    pub has_pending_id: bool,
}

/// Side effects the manager applies after a transition.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    Send(Payload),
    /// Adopt the negotiated protocol version.
    RecordVersion(u32),
    /// Adopt the remote's identity.
    RecordPeerId(PeerId),
    /// Remote identity is ambiguous; hold it aside for verification.
    MarkPendingPeerId(PeerId),
    /// The remote is this node itself.
    MarkSelfPeer,
    Disconnect(&'static str),
    /// Generate verification codes and send VERIFICATION_CODES.
    BeginPeerVerify,
    /// Handshake is done; run completion (persist, pings, controller).
    Complete,
}

/// Next state plus the actions that realise the transition.
#[derive(Debug)]
pub struct Transition {
    pub next: HandshakeState,
    pub actions: Vec<HandshakeAction>,
}

/// Digest binding a peer id to a proof nonce.
pub fn proof_digest(peer_id: &PeerId, nonce: &[u8; PROOF_NONCE_LENGTH]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(peer_id);
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Kick off the handshake once the socket is ready. The outbound side
/// speaks first; the inbound side just arms itself to expect VERSION.
pub fn on_ready(direction: Direction, env: &HandshakeEnv) -> Transition {
    let actions = if direction.is_outbound() {
        vec![HandshakeAction::Send(Payload::Version {
            version: env.our_version,
        })]
    } else {
        Vec::new()
    };
    Transition {
        next: if direction.is_outbound() {
            HandshakeState::Version
        } else {
            HandshakeState::Started
        },
        actions,
    }
}

/// Advance the handshake with a received message.
///
/// PEER_VERIFY and VERIFICATION_CODES are resolved across *two* connections
/// and are therefore handled by the manager, not here; this function covers
/// the single-connection ladder up to PROOF.
pub fn advance(
    state: HandshakeState,
    direction: Direction,
    env: &HandshakeEnv,
    message: &Message,
) -> Result<Transition, HandshakeError> {
    let got = message.message_type();
    let expected = state.expected_message();
    if expected != Some(got) {
        return Err(HandshakeError::Unexpected {
            state: state.name(),
            got,
        });
    }

    match (&message.payload, state) {
        (Payload::Version { version }, HandshakeState::Started | HandshakeState::Version) => {
            let effective = (*version).min(env.our_version).max(1);
            let mut actions = vec![HandshakeAction::RecordVersion(effective)];
            if direction.is_outbound() {
                actions.push(HandshakeAction::Send(Payload::PeerId(env.our_peer_id)));
            } else {
                // Answer in kind; our PEER_ID waits until theirs arrives.
                actions.push(HandshakeAction::Send(Payload::Version {
                    version: env.our_version,
                }));
            }
            Ok(Transition {
                next: HandshakeState::PeerId,
                actions,
            })
        }

        (Payload::PeerId(remote_id), HandshakeState::PeerId) => {
            if *remote_id == ZERO_PEER_ID {
                return Ok(Transition {
                    next: state,
                    actions: vec![HandshakeAction::Disconnect("zero peer id")],
                });
            }
            if *remote_id == env.our_peer_id {
                let mut actions = Vec::new();
                if !direction.is_outbound() {
                    // Let the dialling side see our id before we hang up,
                    // so it can mark its outbound address as self too.
                    actions.push(HandshakeAction::Send(Payload::PeerId(env.our_peer_id)));
                }
                actions.push(HandshakeAction::MarkSelfPeer);
                actions.push(HandshakeAction::Disconnect("connected to self"));
                return Ok(Transition {
                    next: state,
                    actions,
                });
            }

            let mut actions = Vec::new();
            if direction.is_outbound() && env.inbound_claims_id {
                actions.push(HandshakeAction::MarkPendingPeerId(*remote_id));
            } else {
                actions.push(HandshakeAction::RecordPeerId(*remote_id));
            }

            if direction.is_outbound() {
                let digest = proof_digest(&env.our_peer_id, &env.our_proof_nonce);
                actions.push(HandshakeAction::Send(Payload::Proof {
                    nonce: env.our_proof_nonce,
                    digest,
                }));
            } else {
                actions.push(HandshakeAction::Send(Payload::PeerId(env.our_peer_id)));
            }
            Ok(Transition {
                next: HandshakeState::Proof,
                actions,
            })
        }

        (Payload::Proof { nonce, digest }, HandshakeState::Proof) => {
            let remote_id = env.remote_peer_id.ok_or(HandshakeError::MissingPeerId)?;
            if proof_digest(&remote_id, nonce) != *digest {
                return Err(HandshakeError::ProofMismatch);
            }

            let mut actions = Vec::new();
            if !direction.is_outbound() {
                let our_digest = proof_digest(&env.our_peer_id, &env.our_proof_nonce);
                actions.push(HandshakeAction::Send(Payload::Proof {
                    nonce: env.our_proof_nonce,
                    digest: our_digest,
                }));
            }
            // A held-aside doppelganger id needs resolving before the
            // connection is trusted.
            if direction.is_outbound() && env.has_pending_id {
                actions.push(HandshakeAction::BeginPeerVerify);
                Ok(Transition {
                    next: HandshakeState::PeerVerify,
                    actions,
                })
            } else {
                actions.push(HandshakeAction::Complete);
                Ok(Transition {
                    next: HandshakeState::Completed,
                    actions,
                })
            }
        }

        _ => Err(HandshakeError::Unexpected {
            state: state.name(),
            got,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(fill: u8) -> PeerId {
        let mut id = [fill; crate::message::PEER_ID_LENGTH];
        id[crate::message::PEER_ID_LENGTH - 1] |= 0x01;
        id
    }

    fn env() -> HandshakeEnv {
        HandshakeEnv {
            our_peer_id: peer_id(0xaa),
            our_version: 2,
            our_proof_nonce: [0x55; PROOF_NONCE_LENGTH],
            remote_peer_id: None,
            inbound_claims_id: false,
            has_pending_id: false,
        }
    }

    fn version_message() -> Message {
        Message::new(Payload::Version { version: 2 })
    }

    #[test]
    fn test_outbound_speaks_first() {
        let transition = on_ready(Direction::Outbound, &env());
        assert_eq!(transition.next, HandshakeState::Version);
        assert_eq!(
            transition.actions,
            vec![HandshakeAction::Send(Payload::Version { version: 2 })]
        );

        let transition = on_ready(Direction::Inbound, &env());
        assert_eq!(transition.next, HandshakeState::Started);
        assert!(transition.actions.is_empty());
    }

    #[test]
    fn test_full_outbound_ladder() {
        let mut env = env();
        let remote = peer_id(0xbb);

        // VERSION reply arrives.
        let t = advance(
            HandshakeState::Version,
            Direction::Outbound,
            &env,
            &version_message(),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::PeerId);
        assert!(t
            .actions
            .contains(&HandshakeAction::Send(Payload::PeerId(env.our_peer_id))));

        // PEER_ID arrives; outbound must push its PROOF.
        let t = advance(
            HandshakeState::PeerId,
            Direction::Outbound,
            &env,
            &Message::new(Payload::PeerId(remote)),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::Proof);
        assert!(t.actions.contains(&HandshakeAction::RecordPeerId(remote)));
        assert!(matches!(
            t.actions.last(),
            Some(HandshakeAction::Send(Payload::Proof { .. }))
        ));

        // PROOF arrives and verifies.
        env.remote_peer_id = Some(remote);
        let nonce = [9u8; PROOF_NONCE_LENGTH];
        let t = advance(
            HandshakeState::Proof,
            Direction::Outbound,
            &env,
            &Message::new(Payload::Proof {
                nonce,
                digest: proof_digest(&remote, &nonce),
            }),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::Completed);
        assert!(t.actions.contains(&HandshakeAction::Complete));
    }

    #[test]
    fn test_inbound_mirrors_each_step() {
        let mut env = env();
        let remote = peer_id(0xbb);

        let t = advance(
            HandshakeState::Started,
            Direction::Inbound,
            &env,
            &version_message(),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::PeerId);
        // Replies VERSION, does not volunteer PEER_ID yet.
        assert!(t
            .actions
            .contains(&HandshakeAction::Send(Payload::Version { version: 2 })));
        assert!(!t
            .actions
            .iter()
            .any(|a| matches!(a, HandshakeAction::Send(Payload::PeerId(_)))));

        let t = advance(
            HandshakeState::PeerId,
            Direction::Inbound,
            &env,
            &Message::new(Payload::PeerId(remote)),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::Proof);
        assert!(t
            .actions
            .contains(&HandshakeAction::Send(Payload::PeerId(env.our_peer_id))));

        env.remote_peer_id = Some(remote);
        let nonce = [9u8; PROOF_NONCE_LENGTH];
        let t = advance(
            HandshakeState::Proof,
            Direction::Inbound,
            &env,
            &Message::new(Payload::Proof {
                nonce,
                digest: proof_digest(&remote, &nonce),
            }),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::Completed);
        // Inbound answers with its own PROOF before completing.
        assert!(matches!(
            t.actions.first(),
            Some(HandshakeAction::Send(Payload::Proof { .. }))
        ));
    }

    #[test]
    fn test_self_connect_detected_outbound() {
        let env = env();
        let t = advance(
            HandshakeState::PeerId,
            Direction::Outbound,
            &env,
            &Message::new(Payload::PeerId(env.our_peer_id)),
        )
        .unwrap();
        assert_eq!(
            t.actions,
            vec![
                HandshakeAction::MarkSelfPeer,
                HandshakeAction::Disconnect("connected to self"),
            ]
        );
    }

    #[test]
    fn test_self_connect_detected_inbound_replies_first() {
        let env = env();
        let t = advance(
            HandshakeState::PeerId,
            Direction::Inbound,
            &env,
            &Message::new(Payload::PeerId(env.our_peer_id)),
        )
        .unwrap();
        assert_eq!(
            t.actions,
            vec![
                HandshakeAction::Send(Payload::PeerId(env.our_peer_id)),
                HandshakeAction::MarkSelfPeer,
                HandshakeAction::Disconnect("connected to self"),
            ]
        );
    }

    #[test]
    fn test_zero_peer_id_rejected() {
        let env = env();
        let t = advance(
            HandshakeState::PeerId,
            Direction::Inbound,
            &env,
            &Message::new(Payload::PeerId(ZERO_PEER_ID)),
        )
        .unwrap();
        assert_eq!(
            t.actions,
            vec![HandshakeAction::Disconnect("zero peer id")]
        );
    }

    #[test]
    fn test_doppelganger_goes_to_peer_verify() {
        let mut env = env();
        env.inbound_claims_id = true;
        let remote = peer_id(0xbb);

        let t = advance(
            HandshakeState::PeerId,
            Direction::Outbound,
            &env,
            &Message::new(Payload::PeerId(remote)),
        )
        .unwrap();
        assert!(t
            .actions
            .contains(&HandshakeAction::MarkPendingPeerId(remote)));

        env.remote_peer_id = Some(remote);
        env.has_pending_id = true;
        let nonce = [9u8; PROOF_NONCE_LENGTH];
        let t = advance(
            HandshakeState::Proof,
            Direction::Outbound,
            &env,
            &Message::new(Payload::Proof {
                nonce,
                digest: proof_digest(&remote, &nonce),
            }),
        )
        .unwrap();
        assert_eq!(t.next, HandshakeState::PeerVerify);
        assert!(t.actions.contains(&HandshakeAction::BeginPeerVerify));
    }

    #[test]
    fn test_proof_mismatch_fails() {
        let mut env = env();
        let remote = peer_id(0xbb);
        env.remote_peer_id = Some(remote);

        let nonce = [9u8; PROOF_NONCE_LENGTH];
        let wrong = proof_digest(&peer_id(0xcc), &nonce);
        let result = advance(
            HandshakeState::Proof,
            Direction::Inbound,
            &env,
            &Message::new(Payload::Proof {
                nonce,
                digest: wrong,
            }),
        );
        assert_eq!(result.unwrap_err(), HandshakeError::ProofMismatch);
    }

    #[test]
    fn test_unexpected_message_rejected() {
        let env = env();
        let result = advance(
            HandshakeState::Started,
            Direction::Inbound,
            &env,
            &Message::new(Payload::GetPeers),
        );
        assert!(matches!(
            result,
            Err(HandshakeError::Unexpected {
                state: "STARTED",
                got: MessageType::GetPeers
            })
        ));
    }
}
