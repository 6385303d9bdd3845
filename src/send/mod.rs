//! Hybrid delivery coordinator
//!
//! Tries the BLE mesh first, falls back to Nostr relays for directed
//! sends with no local path, and accumulates a monotonic delivery
//! receipt fed by DELIVERY_ACK packets and Nostr receipt events.

use crate::clock::Clock;
use crate::identity::NodeIdentity;
use crate::noise::SessionManager;
use crate::protocol::{ChatMessage, Fragmenter, MessageKind, PeerId};
use crate::relay::{nip04_encrypt, NostrRelayPool};
use crate::transport::BleTransport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

/// Default confirmation wait
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper clamp on any confirmation wait
pub const MAX_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

/// How long receipts linger for late confirmations
pub const RECEIPT_RETENTION_MS: u64 = 300_000;

/// Send errors surfaced by the coordinator
#[derive(Error, Debug)]
pub enum SendError {
    #[error("codec error: {0}")]
    Codec(#[from] crate::protocol::CodecError),

    #[error("unknown tx id")]
    UnknownTxId,
}

/// Which channels carried the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMethod {
    None,
    Ble,
    Nostr,
    Both,
}

/// Monotonic per-send delivery record
///
/// Channel booleans never flip back to false and confirmations only
/// append, each confirming pubkey at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_id: String,
    pub sent_via_ble: bool,
    pub sent_via_nostr: bool,
    pub ble_peer_count: u32,
    pub nostr_relay_count: u32,
    pub delivery_method: DeliveryMethod,
    pub confirmations: Vec<String>,
    pub created_at: u64,
}

impl Receipt {
    pub fn new(tx_id: String, created_at: u64) -> Self {
        Self {
            tx_id,
            sent_via_ble: false,
            sent_via_nostr: false,
            ble_peer_count: 0,
            nostr_relay_count: 0,
            delivery_method: DeliveryMethod::None,
            confirmations: Vec::new(),
            created_at,
        }
    }

    pub fn mark_ble(&mut self, peer_count: u32) {
        self.sent_via_ble = true;
        self.ble_peer_count = self.ble_peer_count.max(peer_count);
        self.recompute_method();
    }

    pub fn mark_nostr(&mut self, relay_count: u32) {
        self.sent_via_nostr = true;
        self.nostr_relay_count = self.nostr_relay_count.max(relay_count);
        self.recompute_method();
    }

    /// Append a confirming pubkey; duplicates are ignored
    pub fn add_confirmation(&mut self, pubkey: &str) -> bool {
        if self.confirmations.iter().any(|existing| existing == pubkey) {
            return false;
        }
        self.confirmations.push(pubkey.to_string());
        true
    }

    pub fn is_confirmed(&self) -> bool {
        !self.confirmations.is_empty()
    }

    fn recompute_method(&mut self) {
        self.delivery_method = match (self.sent_via_ble, self.sent_via_nostr) {
            (false, false) => DeliveryMethod::None,
            (true, false) => DeliveryMethod::Ble,
            (false, true) => DeliveryMethod::Nostr,
            (true, true) => DeliveryMethod::Both,
        };
    }
}

/// DELIVERY_ACK packet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub tx_id: String,
    /// Base58 pubkey of the confirming peer
    pub confirmer: String,
}

impl DeliveryAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.tx_id.len() + self.confirmer.len());
        bytes.push(self.tx_id.len() as u8);
        bytes.extend_from_slice(self.tx_id.as_bytes());
        bytes.push(self.confirmer.len() as u8);
        bytes.extend_from_slice(self.confirmer.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let tx_len = *bytes.first()? as usize;
        let tx_id = String::from_utf8(bytes.get(1..1 + tx_len)?.to_vec()).ok()?;
        let rest = bytes.get(1 + tx_len..)?;
        let conf_len = *rest.first()? as usize;
        let confirmer = String::from_utf8(rest.get(1..1 + conf_len)?.to_vec()).ok()?;
        Some(Self { tx_id, confirmer })
    }
}

/// One outbound send
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub content: String,
    pub sender_nickname: String,
    pub recipient: Option<PeerId>,
    /// Hex Nostr pubkey for the DM fallback path
    pub recipient_nostr_pubkey: Option<String>,
    /// Caller-supplied id; a UUID is minted when absent
    pub tx_id: Option<String>,
    pub has_internet: bool,
}

type ReachabilityProbe = Box<dyn Fn(&PeerId) -> Option<String> + Send + Sync>;

/// BLE-first, Nostr-fallback send coordinator
pub struct HybridSend {
    identity: Arc<NodeIdentity>,
    transport: Arc<dyn BleTransport>,
    relay_pool: Arc<dyn NostrRelayPool>,
    sessions: Arc<Mutex<SessionManager>>,
    clock: Arc<dyn Clock>,
    receipts: RwLock<HashMap<String, Receipt>>,
    confirmations_tx: broadcast::Sender<String>,
    reachability: RwLock<Option<ReachabilityProbe>>,
}

impl HybridSend {
    pub fn new(
        identity: Arc<NodeIdentity>,
        transport: Arc<dyn BleTransport>,
        relay_pool: Arc<dyn NostrRelayPool>,
        sessions: Arc<Mutex<SessionManager>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (confirmations_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            identity,
            transport,
            relay_pool,
            sessions,
            clock,
            receipts: RwLock::new(HashMap::new()),
            confirmations_tx,
            reachability: RwLock::new(None),
        })
    }

    /// Install the peer-id to transport-handle lookup
    ///
    /// Injected as a capability so the coordinator never holds the peer
    /// table itself.
    pub async fn set_reachability_probe(&self, probe: ReachabilityProbe) {
        *self.reachability.write().await = Some(probe);
    }

    /// Listen for Nostr-side receipts for as long as the SDK lives
    pub fn spawn_nostr_receipt_listener(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut receipts = self.relay_pool.subscribe_receipts();
        tokio::spawn(async move {
            while let Ok(receipt) = receipts.recv().await {
                coordinator
                    .note_confirmation(&receipt.tx_id, &receipt.from_pubkey)
                    .await;
            }
            tracing::debug!("nostr receipt stream closed");
        });
    }

    /// Execute the hybrid policy for one send
    pub async fn execute(&self, request: SendRequest) -> Result<Receipt, SendError> {
        let tx_id = request
            .tx_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now_ms = self.clock.now_millis();
        let mut receipt = Receipt::new(tx_id.clone(), now_ms);

        // Register before transmitting so confirmations racing the send
        // still find their receipt
        self.receipts
            .write()
            .await
            .insert(tx_id.clone(), receipt.clone());

        let peers = self.transport.connected_peers().await;
        let recipient_handle = match request.recipient {
            Some(recipient) => self.lookup_handle(&recipient).await,
            None => None,
        };

        if !peers.is_empty() {
            let delivered = self
                .send_ble(&request, &tx_id, &peers, recipient_handle.as_deref(), now_ms)
                .await?;
            if delivered > 0 {
                receipt.mark_ble(delivered);
            }
        }

        // Internet fallback for sends the local mesh cannot carry
        let recipient_unreached = request.recipient.is_some() && recipient_handle.is_none();
        if request.has_internet && (peers.is_empty() || recipient_unreached) {
            match self.send_nostr(&request).await {
                Ok(relay_count) if relay_count > 0 => receipt.mark_nostr(relay_count),
                Ok(_) => {}
                Err(e) => tracing::warn!("nostr fallback failed: {}", e),
            }
        }

        tracing::info!(
            "send {} complete: {:?} (ble peers {}, relays {})",
            tx_id,
            receipt.delivery_method,
            receipt.ble_peer_count,
            receipt.nostr_relay_count
        );

        // Merge channel outcomes into the registered receipt without
        // clobbering confirmations that already arrived
        let mut receipts = self.receipts.write().await;
        let entry = receipts
            .entry(tx_id)
            .or_insert_with(|| receipt.clone());
        if receipt.sent_via_ble {
            entry.mark_ble(receipt.ble_peer_count);
        }
        if receipt.sent_via_nostr {
            entry.mark_nostr(receipt.nostr_relay_count);
        }
        Ok(entry.clone())
    }

    async fn send_ble(
        &self,
        request: &SendRequest,
        tx_id: &str,
        peers: &[String],
        recipient_handle: Option<&str>,
        now_ms: u64,
    ) -> Result<u32, SendError> {
        let message = ChatMessage::new(
            tx_id.to_string(),
            request.sender_nickname.clone(),
            request.content.clone(),
            now_ms,
        );
        let payload = message.encode()?;

        // Encrypt when a Noise session exists with the recipient
        let (payload, encrypted) = match request.recipient {
            Some(recipient) => {
                let mut sessions = self.sessions.lock().await;
                if sessions.has_session(&recipient) {
                    match sessions.encrypt(&recipient, &payload) {
                        Ok(frame) => (frame, true),
                        Err(e) => {
                            tracing::warn!("session encrypt failed, sending plaintext: {}", e);
                            (payload, false)
                        }
                    }
                } else {
                    (payload, false)
                }
            }
            None => (payload, false),
        };

        let fragmenter = Fragmenter::default();
        let mut packets = fragmenter.fragment_message(
            MessageKind::ChatMessage,
            &payload,
            self.identity.peer_id(),
            request.recipient,
            crate::protocol::MAX_TTL,
            tx_id,
            now_ms,
        );
        if encrypted {
            for packet in &mut packets {
                *packet = packet.clone().with_encrypted_flag();
            }
        }

        // Directed sends with a known handle go point-to-point; everything
        // else floods the neighborhood
        let targets: Vec<String> = match recipient_handle {
            Some(handle) => vec![handle.to_string()],
            None => peers.to_vec(),
        };

        let mut accepted = 0u32;
        for target in &targets {
            let mut all_ok = true;
            for packet in &packets {
                let bytes = packet.encode()?;
                if let Err(e) = self.transport.write(target, &bytes).await {
                    tracing::debug!("write to {} failed: {}", target, e);
                    all_ok = false;
                    break;
                }
            }
            if all_ok {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    async fn send_nostr(&self, request: &SendRequest) -> Result<u32, crate::relay::NostrError> {
        match (&request.recipient, &request.recipient_nostr_pubkey) {
            (Some(_), Some(nostr_pubkey)) => {
                let ciphertext = nip04_encrypt(
                    self.identity.nostr_secret_key(),
                    nostr_pubkey,
                    &request.content,
                )?;
                self.relay_pool.publish_dm(nostr_pubkey, &ciphertext).await
            }
            (Some(_), None) => {
                tracing::warn!("directed send has no nostr pubkey, skipping fallback");
                Ok(0)
            }
            (None, _) => self.relay_pool.publish_note(&request.content).await,
        }
    }

    async fn lookup_handle(&self, peer: &PeerId) -> Option<String> {
        let probe = self.reachability.read().await;
        probe.as_ref().and_then(|probe| probe(peer))
    }

    /// Record a confirmation from either channel
    pub async fn note_confirmation(&self, tx_id: &str, pubkey: &str) {
        let mut receipts = self.receipts.write().await;
        let Some(receipt) = receipts.get_mut(tx_id) else {
            tracing::debug!("confirmation for unknown tx {}", tx_id);
            return;
        };
        if receipt.add_confirmation(pubkey) {
            tracing::info!("delivery of {} confirmed by {}", tx_id, pubkey);
            let _ = self.confirmations_tx.send(tx_id.to_string());
        }
    }

    pub async fn receipt(&self, tx_id: &str) -> Option<Receipt> {
        self.receipts.read().await.get(tx_id).cloned()
    }

    /// Block until the first confirmation or the (clamped) timeout
    ///
    /// Timeouts are the only cancellation: the current receipt comes back
    /// and the subscription stays live for the retention window.
    pub async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        timeout: Duration,
    ) -> Result<Receipt, SendError> {
        let timeout = timeout.min(MAX_CONFIRMATION_TIMEOUT);
        let mut updates = self.confirmations_tx.subscribe();

        {
            let receipts = self.receipts.read().await;
            let receipt = receipts.get(tx_id).ok_or(SendError::UnknownTxId)?;
            if receipt.is_confirmed() {
                return Ok(receipt.clone());
            }
        }

        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(confirmed_id) if confirmed_id == tx_id => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;

        self.receipts
            .read()
            .await
            .get(tx_id)
            .cloned()
            .ok_or(SendError::UnknownTxId)
    }

    /// Drop receipts past the retention window
    pub async fn maintain(&self) {
        let now_ms = self.clock.now_millis();
        let mut receipts = self.receipts.write().await;
        let before = receipts.len();
        receipts.retain(|_, receipt| {
            now_ms.saturating_sub(receipt.created_at) < RECEIPT_RETENTION_MS
        });
        let dropped = before - receipts.len();
        if dropped > 0 {
            tracing::debug!("retired {} old receipts", dropped);
        }
    }
}
