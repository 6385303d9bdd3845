//! Per-peer Noise session table
//!
//! Owns every NoiseSession, dispatches handshake packets and exposes the
//! encrypt/decrypt helpers the send path uses. The static keypair is
//! loaded from the secure store on startup and never leaves the device.

use super::{generate_static_keypair, NoiseError, NoiseSession, SessionState};
use crate::protocol::{MessageKind, Packet, PeerId};
use crate::store::{SecureStore, KEY_NOISE_STATIC_KEYPAIR};
use std::collections::HashMap;

/// Session table keyed by peer
pub struct SessionManager {
    local_peer_id: PeerId,
    static_private: Vec<u8>,
    static_public: Vec<u8>,
    sessions: HashMap<PeerId, NoiseSession>,
}

impl SessionManager {
    /// Load the persisted static keypair, generating one on first run
    pub fn new(local_peer_id: PeerId, store: &dyn SecureStore) -> Result<Self, NoiseError> {
        let (static_private, static_public) = match store.get(KEY_NOISE_STATIC_KEYPAIR) {
            Ok(bytes) if bytes.len() == 64 => {
                tracing::debug!("loaded static noise keypair from secure store");
                (bytes[..32].to_vec(), bytes[32..].to_vec())
            }
            _ => {
                let (private, public) = generate_static_keypair()?;
                let mut bytes = Vec::with_capacity(64);
                bytes.extend_from_slice(&private);
                bytes.extend_from_slice(&public);
                if let Err(e) = store.set(KEY_NOISE_STATIC_KEYPAIR, &bytes) {
                    tracing::warn!("could not persist static noise keypair: {}", e);
                }
                tracing::info!("generated fresh static noise keypair");
                (private, public)
            }
        };

        Ok(Self {
            local_peer_id,
            static_private,
            static_public,
            sessions: HashMap::new(),
        })
    }

    pub fn local_static_public(&self) -> &[u8] {
        &self.static_public
    }

    /// Start a handshake toward a peer, returning the INIT packet
    pub fn initiate_handshake(
        &mut self,
        peer: PeerId,
        now_ms: u64,
    ) -> Result<Packet, NoiseError> {
        let mut session = NoiseSession::new_initiator(&self.static_private, now_ms)?;
        let message = session.write_handshake()?;
        self.sessions.insert(peer, session);

        tracing::debug!("initiating noise handshake with {}", peer);
        Ok(self.handshake_packet(MessageKind::NoiseHandshakeInit, peer, message, now_ms))
    }

    /// Feed one inbound handshake packet through the state machine
    ///
    /// Returns the next packet to send, or None once this side is done.
    pub fn process_handshake(
        &mut self,
        packet: &Packet,
        now_ms: u64,
    ) -> Result<Option<Packet>, NoiseError> {
        let peer = packet.sender;
        match packet.kind() {
            Some(MessageKind::NoiseHandshakeInit) => {
                // A new INIT always supersedes whatever was there; peers
                // renegotiate after failures and restarts.
                let mut session = NoiseSession::new_responder(&self.static_private, now_ms)?;
                session.read_handshake(&packet.payload)?;
                let response = session.write_handshake()?;
                self.sessions.insert(peer, session);

                tracing::debug!("responding to noise handshake from {}", peer);
                Ok(Some(self.handshake_packet(
                    MessageKind::NoiseHandshakeResponse,
                    peer,
                    response,
                    now_ms,
                )))
            }
            Some(MessageKind::NoiseHandshakeResponse) => {
                let session = self.sessions.get_mut(&peer).ok_or(NoiseError::NoSession)?;
                session.read_handshake(&packet.payload)?;
                let finisher = session.write_handshake()?;

                tracing::info!("noise session established with {} (initiator)", peer);
                Ok(Some(self.handshake_packet(
                    MessageKind::NoiseHandshakeFinal,
                    peer,
                    finisher,
                    now_ms,
                )))
            }
            Some(MessageKind::NoiseHandshakeFinal) => {
                let session = self.sessions.get_mut(&peer).ok_or(NoiseError::NoSession)?;
                session.read_handshake(&packet.payload)?;

                tracing::info!("noise session established with {} (responder)", peer);
                Ok(None)
            }
            _ => Err(NoiseError::HandshakeFailed(format!(
                "not a handshake packet: 0x{:02x}",
                packet.message_type
            ))),
        }
    }

    /// Encrypt a transport frame for a peer
    pub fn encrypt(&mut self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let session = self.sessions.get_mut(peer).ok_or(NoiseError::NoSession)?;
        if !session.is_established() {
            return Err(NoiseError::NoSession);
        }
        session.encrypt(plaintext)
    }

    /// Decrypt a transport frame from a peer
    ///
    /// Auth failures poison and evict the session.
    pub fn decrypt(&mut self, peer: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let session = self.sessions.get_mut(peer).ok_or(NoiseError::NoSession)?;
        if !session.is_established() {
            return Err(NoiseError::NoSession);
        }
        match session.decrypt(ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                tracing::warn!("noise decrypt failed for {}, discarding session", peer);
                self.sessions.remove(peer);
                Err(e)
            }
        }
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions
            .get(peer)
            .map(|session| session.is_established())
            .unwrap_or(false)
    }

    /// Fingerprint of the peer's remote static key
    pub fn fingerprint(&self, peer: &PeerId) -> Option<[u8; 8]> {
        self.sessions.get(peer).and_then(|session| session.fingerprint())
    }

    pub fn session_state(&self, peer: &PeerId) -> SessionState {
        self.sessions
            .get(peer)
            .map(|session| session.state())
            .unwrap_or(SessionState::Uninitialized)
    }

    /// Drop a peer's session, e.g. on disconnect
    pub fn remove_session(&mut self, peer: &PeerId) {
        if self.sessions.remove(peer).is_some() {
            tracing::debug!("removed noise session for {}", peer);
        }
    }

    pub fn established_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.is_established())
            .count()
    }

    /// Discard handshakes that outlived their window and failed sessions
    pub fn maintain(&mut self, now_ms: u64) {
        let before = self.sessions.len();
        self.sessions.retain(|peer, session| {
            if session.is_timed_out(now_ms) {
                tracing::warn!("noise handshake with {} timed out", peer);
                return false;
            }
            session.state() != SessionState::Failed
        });
        let dropped = before - self.sessions.len();
        if dropped > 0 {
            tracing::debug!("swept {} dead noise sessions", dropped);
        }
    }

    fn handshake_packet(
        &self,
        kind: MessageKind,
        peer: PeerId,
        message: Vec<u8>,
        now_ms: u64,
    ) -> Packet {
        // Handshakes are point-to-point and never relayed
        Packet::new(kind, self.local_peer_id, message, now_ms)
            .with_recipient(peer)
            .with_ttl(1)
    }
}
