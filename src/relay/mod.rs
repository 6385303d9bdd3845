//! Nostr relay-pool contract
//!
//! Internet-side fallback for directed sends when no BLE path exists.
//! The pool itself lives in the host app; the core consumes this narrow
//! interface and ships the NIP-04 payload helpers plus an in-memory pool
//! for tests.

use async_trait::async_trait;
use nostr::nips::nip04;
use nostr::{PublicKey, SecretKey};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

/// NIP-04 encrypted direct message
pub const KIND_ENCRYPTED_DM: u16 = 4;

/// Public text note used for broadcast sends
pub const KIND_TEXT_NOTE: u16 = 1;

/// Application-specific delivery receipt events
pub const KIND_DELIVERY_RECEIPT: u16 = 30333;

/// Nostr errors
#[derive(Error, Debug)]
pub enum NostrError {
    #[error("no relays configured")]
    NoRelays,

    #[error("publish rejected by all relays")]
    PublishRejected,

    #[error("receipt subscription closed")]
    SubscribeClosed,

    #[error("NIP-04 decryption failed: {0}")]
    DecryptFailed(String),
}

/// Delivery receipt observed on the Nostr side
#[derive(Debug, Clone)]
pub struct NostrReceipt {
    /// tx id the receipt confirms
    pub tx_id: String,
    /// hex pubkey of the confirming party
    pub from_pubkey: String,
}

/// Relay pool consumed by the hybrid send coordinator
///
/// Publish methods return how many relays accepted the event.
#[async_trait]
pub trait NostrRelayPool: Send + Sync {
    /// Publish a NIP-04 encrypted DM (kind 4)
    async fn publish_dm(
        &self,
        recipient_pubkey: &str,
        ciphertext: &str,
    ) -> Result<u32, NostrError>;

    /// Publish a public note (kind 1)
    async fn publish_note(&self, content: &str) -> Result<u32, NostrError>;

    /// Subscribe to inbound delivery receipts
    fn subscribe_receipts(&self) -> broadcast::Receiver<NostrReceipt>;
}

/// Encrypt a DM payload for a recipient's hex pubkey
pub fn nip04_encrypt(
    secret: &SecretKey,
    recipient_hex: &str,
    plaintext: &str,
) -> Result<String, NostrError> {
    let recipient =
        PublicKey::from_hex(recipient_hex).map_err(|e| NostrError::DecryptFailed(e.to_string()))?;
    nip04::encrypt(secret, &recipient, plaintext)
        .map_err(|e| NostrError::DecryptFailed(e.to_string()))
}

/// Decrypt an inbound NIP-04 payload from a sender's hex pubkey
pub fn nip04_decrypt(
    secret: &SecretKey,
    sender_hex: &str,
    ciphertext: &str,
) -> Result<String, NostrError> {
    let sender =
        PublicKey::from_hex(sender_hex).map_err(|e| NostrError::DecryptFailed(e.to_string()))?;
    nip04::decrypt(secret, &sender, ciphertext)
        .map_err(|e| NostrError::DecryptFailed(e.to_string()))
}

/// Record of one published event, kept by the in-memory pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub kind: u16,
    pub recipient: Option<String>,
    pub content: String,
}

/// In-memory relay pool for tests and the demo binary
pub struct MemoryRelayPool {
    relay_count: AtomicU32,
    published: Mutex<Vec<PublishedEvent>>,
    receipts_tx: broadcast::Sender<NostrReceipt>,
}

impl MemoryRelayPool {
    pub fn new(relay_count: u32) -> Self {
        let (receipts_tx, _) = broadcast::channel(64);
        Self {
            relay_count: AtomicU32::new(relay_count),
            published: Mutex::new(Vec::new()),
            receipts_tx,
        }
    }

    /// Simulate relays dropping away
    pub fn set_relay_count(&self, count: u32) {
        self.relay_count.store(count, Ordering::SeqCst);
    }

    /// Inject a receipt as if a relay delivered it
    pub fn inject_receipt(&self, receipt: NostrReceipt) {
        let _ = self.receipts_tx.send(receipt);
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published.lock().expect("publish log").clone()
    }

    fn record(&self, event: PublishedEvent) -> Result<u32, NostrError> {
        let relays = self.relay_count.load(Ordering::SeqCst);
        if relays == 0 {
            return Err(NostrError::NoRelays);
        }
        self.published.lock().expect("publish log").push(event);
        Ok(relays)
    }
}

#[async_trait]
impl NostrRelayPool for MemoryRelayPool {
    async fn publish_dm(
        &self,
        recipient_pubkey: &str,
        ciphertext: &str,
    ) -> Result<u32, NostrError> {
        self.record(PublishedEvent {
            kind: KIND_ENCRYPTED_DM,
            recipient: Some(recipient_pubkey.to_string()),
            content: ciphertext.to_string(),
        })
    }

    async fn publish_note(&self, content: &str) -> Result<u32, NostrError> {
        self.record(PublishedEvent {
            kind: KIND_TEXT_NOTE,
            recipient: None,
            content: content.to_string(),
        })
    }

    fn subscribe_receipts(&self) -> broadcast::Receiver<NostrReceipt> {
        self.receipts_tx.subscribe()
    }
}
