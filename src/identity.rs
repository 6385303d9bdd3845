//! Node identity
//!
//! One Ed25519 keypair controls everything: Solana transactions, packet
//! signatures, the mesh PeerId and (via a deterministic derivation) the
//! secp256k1 Nostr identity.

use crate::protocol::PeerId;
use nostr::{Keys, SecretKey};
use sha2::{Digest, Sha256};
use solana_sdk::signature::{Keypair, Signer};
use thiserror::Error;

/// Identity errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid keypair bytes: {0}")]
    InvalidKeypair(String),

    #[error("nostr key derivation failed: {0}")]
    NostrDerivation(String),
}

/// The device's long-lived identity
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
    nostr_secret: SecretKey,
    nostr_keys: Keys,
}

impl NodeIdentity {
    /// Wrap an existing wallet keypair
    pub fn from_keypair(keypair: Keypair) -> Result<Self, IdentityError> {
        let peer_id = PeerId::from_public_key(&keypair.pubkey().to_bytes());
        let (nostr_secret, nostr_keys) = derive_nostr_keys(&keypair)?;
        Ok(Self {
            keypair,
            peer_id,
            nostr_secret,
            nostr_keys,
        })
    }

    /// Fresh identity for ephemeral nodes and tests
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::new()).expect("fresh keypair always derives")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let keypair = Keypair::from_bytes(bytes)
            .map_err(|e| IdentityError::InvalidKeypair(e.to_string()))?;
        Self::from_keypair(keypair)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Full Ed25519 public key, base58
    pub fn pubkey_base58(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.pubkey().to_bytes()
    }

    /// Derived secp256k1 keys for the Nostr side
    pub fn nostr_keys(&self) -> &Keys {
        &self.nostr_keys
    }

    /// The Nostr secret, for NIP-04 payload encryption
    pub fn nostr_secret_key(&self) -> &SecretKey {
        &self.nostr_secret
    }
}

/// Derive Nostr keys from the Solana keypair
///
/// SHA-256 of the 32-byte Ed25519 seed becomes the secp256k1 secret, so
/// deleting the wallet key rotates both identities together.
fn derive_nostr_keys(keypair: &Keypair) -> Result<(SecretKey, Keys), IdentityError> {
    let seed = &keypair.to_bytes()[..32];
    let secret = Sha256::digest(seed);
    let secret_key = SecretKey::from_slice(&secret)
        .map_err(|e| IdentityError::NostrDerivation(e.to_string()))?;
    Ok((secret_key.clone(), Keys::new(secret_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_matches_pubkey() {
        let identity = NodeIdentity::generate();
        let expected = PeerId::from_public_key(&identity.public_key_bytes());
        assert_eq!(identity.peer_id(), expected);
    }

    #[test]
    fn test_nostr_derivation_deterministic() {
        let keypair = Keypair::new();
        let bytes = keypair.to_bytes();

        let a = NodeIdentity::from_bytes(&bytes).unwrap();
        let b = NodeIdentity::from_bytes(&bytes).unwrap();
        assert_eq!(a.nostr_keys().public_key(), b.nostr_keys().public_key());
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_distinct_identities_distinct_keys() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
        assert_ne!(a.nostr_keys().public_key(), b.nostr_keys().public_key());
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        assert!(NodeIdentity::from_bytes(&[1, 2, 3]).is_err());
    }
}
