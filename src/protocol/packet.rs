//! Binary packet codec
//!
//! Fixed-layout big-endian packets padded to standard block sizes.
//! Deterministic padding keeps retransmissions byte-identical so router
//! deduplication stays exact.

use super::{MessageKind, PeerId, MAX_TTL, PROTOCOL_VERSION, STANDARD_BLOCK_SIZES};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::signature::{Keypair, Signature, Signer};
use thiserror::Error;

/// Fixed header size: version, type, ttl, timestamp, flags, payload length
pub const HEADER_SIZE: usize = 14;

/// Sender / recipient identifier size
pub const PEER_ID_SIZE: usize = 8;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum payload carried by one packet
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Codec errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload exceeds {MAX_PAYLOAD_SIZE} bytes")]
    PayloadTooLarge,

    #[error("packet truncated: {0}")]
    Truncated(String),

    #[error("unsupported protocol version {0}")]
    VersionUnsupported(u8),

    #[error("flags inconsistent with packet fields")]
    FlagsInconsistent,
}

/// Header flag bits controlling optional fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0x00);
    pub const HAS_RECIPIENT: Self = Self(0x01);
    pub const HAS_SIGNATURE: Self = Self(0x02);
    /// Reserved; no compressor is wired in
    pub const IS_COMPRESSED: Self = Self(0x04);
    /// Payload is a Noise transport frame
    pub const IS_ENCRYPTED: Self = Self(0x08);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn has_recipient(self) -> bool {
        self.0 & Self::HAS_RECIPIENT.0 != 0
    }

    pub const fn has_signature(self) -> bool {
        self.0 & Self::HAS_SIGNATURE.0 != 0
    }

    pub const fn is_compressed(self) -> bool {
        self.0 & Self::IS_COMPRESSED.0 != 0
    }

    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::IS_ENCRYPTED.0 != 0
    }

    pub fn with_recipient(mut self) -> Self {
        self.0 |= Self::HAS_RECIPIENT.0;
        self
    }

    pub fn with_signature(mut self) -> Self {
        self.0 |= Self::HAS_SIGNATURE.0;
        self
    }

    pub fn with_encrypted(mut self) -> Self {
        self.0 |= Self::IS_ENCRYPTED.0;
        self
    }
}

/// Mesh packet
///
/// The message type is kept as the raw byte so kinds minted after this
/// build are relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub message_type: u8,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub flags: PacketFlags,
    pub sender: PeerId,
    pub recipient: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; 64]>,
}

impl Packet {
    pub fn new(kind: MessageKind, sender: PeerId, payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: kind.as_u8(),
            ttl: MAX_TTL,
            timestamp_ms,
            flags: PacketFlags::NONE,
            sender,
            recipient: None,
            payload,
            signature: None,
        }
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient = Some(recipient);
        self.flags = self.flags.with_recipient();
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl.min(MAX_TTL);
        self
    }

    pub fn with_encrypted_flag(mut self) -> Self {
        self.flags = self.flags.with_encrypted();
        self
    }

    /// Interpreted message kind, None for kinds this build does not know
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_u8(self.message_type)
    }

    pub fn is_broadcast(&self) -> bool {
        match self.recipient {
            None => true,
            Some(r) => r.is_broadcast(),
        }
    }

    /// Structural consistency between flags and optional fields
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.version != PROTOCOL_VERSION {
            return Err(CodecError::VersionUnsupported(self.version));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge);
        }
        if self.flags.has_recipient() != self.recipient.is_some() {
            return Err(CodecError::FlagsInconsistent);
        }
        if self.flags.has_signature() != self.signature.is_some() {
            return Err(CodecError::FlagsInconsistent);
        }
        Ok(())
    }

    /// Size of the encoded packet before padding
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE
            + PEER_ID_SIZE
            + if self.recipient.is_some() { PEER_ID_SIZE } else { 0 }
            + self.payload.len()
            + if self.signature.is_some() { SIGNATURE_SIZE } else { 0 }
    }

    /// Encode to wire bytes, padded to a standard block size
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;

        let raw_size = self.encoded_size();
        let target = STANDARD_BLOCK_SIZES
            .iter()
            .copied()
            .find(|&block| block >= raw_size)
            .unwrap_or(raw_size);

        let mut bytes = Vec::with_capacity(target);
        bytes.push(self.version);
        bytes.push(self.message_type);
        bytes.push(self.ttl);
        bytes.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        bytes.push(self.flags.as_u8());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(self.sender.as_bytes());
        if let Some(recipient) = &self.recipient {
            bytes.extend_from_slice(recipient.as_bytes());
        }
        bytes.extend_from_slice(&self.payload);
        if let Some(signature) = &self.signature {
            bytes.extend_from_slice(signature);
        }

        // PKCS#7-style tail: every pad byte carries the pad length's low
        // eight bits. Decode is length-driven, the value is never read.
        let pad_len = target - bytes.len();
        bytes.resize(target, (pad_len & 0xFF) as u8);

        Ok(bytes)
    }

    /// Decode wire bytes, ignoring trailing padding
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE + PEER_ID_SIZE {
            return Err(CodecError::Truncated("short of fixed header".into()));
        }

        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(CodecError::VersionUnsupported(version));
        }

        let message_type = bytes[1];
        let ttl = bytes[2];
        let timestamp_ms = u64::from_be_bytes(
            bytes[3..11]
                .try_into()
                .map_err(|_| CodecError::Truncated("timestamp".into()))?,
        );
        let flags = PacketFlags::new(bytes[11]);
        let payload_len = u16::from_be_bytes([bytes[12], bytes[13]]) as usize;

        let mut offset = HEADER_SIZE;
        let sender = PeerId::from_slice(&bytes[offset..offset + PEER_ID_SIZE])
            .ok_or_else(|| CodecError::Truncated("sender id".into()))?;
        offset += PEER_ID_SIZE;

        let recipient = if flags.has_recipient() {
            if bytes.len() < offset + PEER_ID_SIZE {
                return Err(CodecError::Truncated("recipient id".into()));
            }
            let id = PeerId::from_slice(&bytes[offset..offset + PEER_ID_SIZE])
                .ok_or_else(|| CodecError::Truncated("recipient id".into()))?;
            offset += PEER_ID_SIZE;
            Some(id)
        } else {
            None
        };

        if bytes.len() < offset + payload_len {
            return Err(CodecError::Truncated("payload".into()));
        }
        let payload = bytes[offset..offset + payload_len].to_vec();
        offset += payload_len;

        let signature = if flags.has_signature() {
            if bytes.len() < offset + SIGNATURE_SIZE {
                return Err(CodecError::Truncated("signature".into()));
            }
            let mut sig = [0u8; SIGNATURE_SIZE];
            sig.copy_from_slice(&bytes[offset..offset + SIGNATURE_SIZE]);
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            version,
            message_type,
            ttl,
            timestamp_ms,
            flags,
            sender,
            recipient,
            payload,
            signature,
        })
    }

    /// Sign with the node's Ed25519 identity keypair
    ///
    /// TTL is excluded from the canonical bytes so relays can decrement
    /// it without invalidating the signature.
    pub fn sign(&mut self, keypair: &Keypair) {
        let digest = self.canonical_digest();
        let signature = keypair.sign_message(&digest);
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(signature.as_ref());
        self.signature = Some(sig);
        self.flags = self.flags.with_signature();
    }

    /// Verify the signature against a full Ed25519 public key
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> bool {
        let Some(sig_bytes) = self.signature else {
            return false;
        };
        let Ok(signature) = Signature::try_from(&sig_bytes[..]) else {
            return false;
        };
        signature.verify(public_key, &self.canonical_digest())
    }

    fn canonical_digest(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"murmurnet-packet-v1");
        hasher.update([self.version]);
        hasher.update([self.message_type]);
        hasher.update(self.timestamp_ms.to_be_bytes());
        hasher.update(self.sender.as_bytes());
        if let Some(recipient) = &self.recipient {
            hasher.update(recipient.as_bytes());
        }
        hasher.update(&self.payload);
        hasher.finalize().to_vec()
    }

    /// Fingerprint fed to the router's bloom filter
    ///
    /// Sender, timestamp and payload prefix; padding is deterministic so
    /// re-encoded copies fingerprint identically.
    pub fn dedup_fingerprint(&self) -> String {
        let prefix_len = self.payload.len().min(8);
        format!(
            "{}:{}:{}",
            self.sender.to_hex(),
            self.timestamp_ms,
            hex::encode(&self.payload[..prefix_len])
        )
    }
}
