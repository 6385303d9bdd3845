//! Mesh wire protocol
//!
//! Packet codec, duplicate-suppression bloom filter, fragmentation and
//! the TTL-bounded flood router.

pub mod bloom;
pub mod chat;
pub mod fragment;
pub mod packet;
pub mod router;

pub use bloom::BloomSet;
pub use chat::{ChatFlags, ChatMessage};
pub use fragment::{FragmentHeader, Fragmenter, Reassembler};
pub use packet::{CodecError, Packet, PacketFlags};
pub use router::{DropReason, Router, RouterStats, RoutingDecision};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol version carried in every packet header
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum TTL a packet may carry
pub const MAX_TTL: u8 = 10;

/// Standard padded packet sizes, resistant to traffic analysis
pub const STANDARD_BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// 8-byte truncated peer identifier
///
/// Derived as the first 8 bytes of SHA-256 over the peer's full public
/// identity key. Not cryptographically binding on its own; the Noise
/// session binds full keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// The all-ones broadcast identifier
    pub const BROADCAST: PeerId = PeerId([0xFF; 8]);

    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Derive a peer id from a full public identity key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Wire message kinds
///
/// The raw type byte travels with the packet so forwarders relay kinds
/// this build does not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    NoiseHandshakeInit = 0x01,
    NoiseHandshakeResponse = 0x02,
    NoiseHandshakeFinal = 0x03,
    ChatMessage = 0x10,
    DeliveryAck = 0x11,
    ReadReceipt = 0x12,
    FragmentStart = 0x20,
    FragmentContinue = 0x21,
    FragmentEnd = 0x22,
    PeerAnnouncement = 0x30,
    Ping = 0x31,
    Pong = 0x32,
    SolanaTxRelay = 0x41,
    SolanaTxAck = 0x42,
    SolanaTxResult = 0x43,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageKind::NoiseHandshakeInit),
            0x02 => Some(MessageKind::NoiseHandshakeResponse),
            0x03 => Some(MessageKind::NoiseHandshakeFinal),
            0x10 => Some(MessageKind::ChatMessage),
            0x11 => Some(MessageKind::DeliveryAck),
            0x12 => Some(MessageKind::ReadReceipt),
            0x20 => Some(MessageKind::FragmentStart),
            0x21 => Some(MessageKind::FragmentContinue),
            0x22 => Some(MessageKind::FragmentEnd),
            0x30 => Some(MessageKind::PeerAnnouncement),
            0x31 => Some(MessageKind::Ping),
            0x32 => Some(MessageKind::Pong),
            0x41 => Some(MessageKind::SolanaTxRelay),
            0x42 => Some(MessageKind::SolanaTxAck),
            0x43 => Some(MessageKind::SolanaTxResult),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Handshake kinds are never relayed and always carry ttl = 1
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageKind::NoiseHandshakeInit
                | MessageKind::NoiseHandshakeResponse
                | MessageKind::NoiseHandshakeFinal
        )
    }

    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            MessageKind::FragmentStart | MessageKind::FragmentContinue | MessageKind::FragmentEnd
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_derivation() {
        let key = [7u8; 32];
        let id = PeerId::from_public_key(&key);
        let again = PeerId::from_public_key(&key);
        assert_eq!(id, again);
        assert!(!id.is_broadcast());

        let expected = Sha256::digest(key);
        assert_eq!(id.as_bytes(), &expected[..8]);
    }

    #[test]
    fn test_broadcast_id() {
        assert_eq!(PeerId::BROADCAST.as_bytes(), &[0xFF; 8]);
        assert!(PeerId::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_message_kind_round_trip() {
        for byte in [0x01, 0x02, 0x03, 0x10, 0x11, 0x12, 0x20, 0x21, 0x22, 0x30, 0x31, 0x32, 0x41, 0x42, 0x43] {
            let kind = MessageKind::from_u8(byte).unwrap();
            assert_eq!(kind.as_u8(), byte);
        }
        assert!(MessageKind::from_u8(0x7F).is_none());
    }

    #[test]
    fn test_handshake_kinds() {
        assert!(MessageKind::NoiseHandshakeInit.is_handshake());
        assert!(MessageKind::NoiseHandshakeFinal.is_handshake());
        assert!(!MessageKind::ChatMessage.is_handshake());
        assert!(MessageKind::FragmentContinue.is_fragment());
    }
}
