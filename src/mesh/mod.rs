//! Mesh event loop and peer table
//!
//! One worker task drains transport events, runs every inbound packet
//! through the router and dispatches what remains: handshakes to the
//! session manager, fragments to the reassembler, chat and transaction
//! relay payloads out to the application.

use crate::clock::Clock;
use crate::identity::NodeIdentity;
use crate::noise::SessionManager;
use crate::nonce::DurableNonceEnvelope;
use crate::protocol::{
    ChatMessage, FragmentHeader, Fragmenter, MessageKind, Packet, PeerId, Reassembler, Router,
    RouterStats, RoutingDecision,
};
use crate::send::{DeliveryAck, HybridSend};
use crate::transport::{BleTransport, TransportEvent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Maintenance cadence for router, reassembler and session sweeps
pub const MAINTENANCE_INTERVAL_SECS: u64 = 5;

/// Peers silent for this long fall out of the table
pub const PEER_EXPIRY_MS: u64 = 30_000;

/// One known neighbor
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub handle: String,
    pub peer_id: Option<PeerId>,
    pub nickname: Option<String>,
    pub rssi: Option<i16>,
    pub mtu: u16,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

/// Connected-neighbor table, maintained from transport events
#[derive(Default)]
pub struct PeerTable {
    by_handle: HashMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn upsert(&mut self, handle: &str, now_ms: u64) {
        self.by_handle
            .entry(handle.to_string())
            .and_modify(|entry| entry.last_seen_ms = now_ms)
            .or_insert_with(|| PeerEntry {
                handle: handle.to_string(),
                peer_id: None,
                nickname: None,
                rssi: None,
                mtu: crate::protocol::fragment::DEFAULT_MTU as u16,
                first_seen_ms: now_ms,
                last_seen_ms: now_ms,
            });
    }

    pub fn note_seen(&mut self, handle: &str, now_ms: u64) {
        if let Some(entry) = self.by_handle.get_mut(handle) {
            entry.last_seen_ms = now_ms;
        }
    }

    pub fn bind_identity(&mut self, handle: &str, peer_id: PeerId, nickname: Option<String>) {
        if let Some(entry) = self.by_handle.get_mut(handle) {
            entry.peer_id = Some(peer_id);
            if nickname.is_some() {
                entry.nickname = nickname;
            }
        }
    }

    pub fn set_mtu(&mut self, handle: &str, mtu: u16) {
        if let Some(entry) = self.by_handle.get_mut(handle) {
            entry.mtu = mtu;
        }
    }

    pub fn remove(&mut self, handle: &str) -> Option<PeerEntry> {
        self.by_handle.remove(handle)
    }

    /// Transport handle for a mesh peer id, if we have it bound
    pub fn handle_for(&self, peer_id: &PeerId) -> Option<String> {
        self.by_handle
            .values()
            .find(|entry| entry.peer_id == Some(*peer_id))
            .map(|entry| entry.handle.clone())
    }

    pub fn handles(&self) -> Vec<String> {
        self.by_handle.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    /// Drop silent peers, returning what was evicted
    pub fn expire(&mut self, now_ms: u64) -> Vec<PeerEntry> {
        let expired: Vec<String> = self
            .by_handle
            .values()
            .filter(|entry| now_ms.saturating_sub(entry.last_seen_ms) >= PEER_EXPIRY_MS)
            .map(|entry| entry.handle.clone())
            .collect();
        expired
            .iter()
            .filter_map(|handle| self.by_handle.remove(handle))
            .collect()
    }
}

/// Announcement payload broadcast on connect
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnnouncePayload {
    peer_id: String,
    pubkey: String,
    nickname: String,
}

/// Relay acknowledgment for a received envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxAckPayload {
    envelope_id: String,
}

/// Submission outcome broadcast back toward the origin
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxResultPayload {
    envelope_id: String,
    signature: Option<String>,
    error: Option<String>,
}

/// Events surfaced to the application
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerConnected { handle: String },
    PeerDisconnected { handle: String },
    PeerAnnounced {
        peer: PeerId,
        pubkey_base58: String,
        nickname: String,
    },
    SessionEstablished { peer: PeerId },
    ChatReceived {
        message: ChatMessage,
        from: PeerId,
        was_encrypted: bool,
    },
    TxEnvelopeReceived {
        envelope: DurableNonceEnvelope,
        from: PeerId,
    },
    TxAckReceived { envelope_id: String, from: PeerId },
    TxResultReceived {
        envelope_id: String,
        signature: Option<String>,
        error: Option<String>,
    },
}

/// Short content-derived id used to correlate relay acks and results
pub fn envelope_id(envelope: &DurableNonceEnvelope) -> String {
    let digest = Sha256::digest(&envelope.serialized_tx);
    hex::encode(&digest[..8])
}

/// The device's mesh engine
pub struct MeshService {
    identity: Arc<NodeIdentity>,
    nickname: String,
    transport: Arc<dyn BleTransport>,
    sessions: Arc<Mutex<SessionManager>>,
    hybrid: Arc<HybridSend>,
    clock: Arc<dyn Clock>,
    router: Mutex<Router>,
    reassembler: Mutex<Reassembler>,
    peer_table: Arc<StdRwLock<PeerTable>>,
    events_tx: broadcast::Sender<MeshEvent>,
}

impl MeshService {
    pub fn new(
        identity: Arc<NodeIdentity>,
        nickname: String,
        transport: Arc<dyn BleTransport>,
        sessions: Arc<Mutex<SessionManager>>,
        hybrid: Arc<HybridSend>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let mut router = Router::new(identity.peer_id(), clock.now_millis());
        // Read-only capability instead of a SessionManager reference;
        // a contended lock just reads as "no session yet"
        let probe_sessions = Arc::clone(&sessions);
        router.set_session_probe(Box::new(move |peer| {
            probe_sessions
                .try_lock()
                .map(|sessions| sessions.has_session(peer))
                .unwrap_or(false)
        }));

        Arc::new(Self {
            identity,
            nickname,
            transport,
            sessions,
            hybrid,
            clock,
            router: Mutex::new(router),
            reassembler: Mutex::new(Reassembler::new()),
            peer_table: Arc::new(StdRwLock::new(PeerTable::default())),
            events_tx,
        })
    }

    /// Subscribe to application-facing events
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    pub fn peer_table(&self) -> Arc<StdRwLock<PeerTable>> {
        Arc::clone(&self.peer_table)
    }

    pub async fn router_stats(&self) -> RouterStats {
        self.router.lock().await.stats()
    }

    /// Start the worker: one event processed to completion at a time
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut transport_events = self.transport.events();

        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!("mesh worker started for {}", service.identity.peer_id());

            loop {
                tokio::select! {
                    event = transport_events.recv() => match event {
                        Ok(event) => service.handle_transport_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("mesh worker lagged, {} transport events lost", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("transport event stream closed, mesh worker exiting");
                            break;
                        }
                    },
                    _ = tick.tick() => service.maintain().await,
                }
            }
        })
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        let now_ms = self.clock.now_millis();
        match event {
            TransportEvent::Connected { peer: handle } => {
                self.peer_table.write().expect("peer table").upsert(&handle, now_ms);
                let _ = self.events_tx.send(MeshEvent::PeerConnected {
                    handle: handle.clone(),
                });
                self.send_announcement(&handle).await;
            }
            TransportEvent::Disconnected { peer: handle } => {
                let removed = self.peer_table.write().expect("peer table").remove(&handle);
                if let Some(entry) = removed {
                    if let Some(peer_id) = entry.peer_id {
                        self.sessions.lock().await.remove_session(&peer_id);
                    }
                }
                let _ = self.events_tx.send(MeshEvent::PeerDisconnected { handle });
            }
            TransportEvent::MtuChanged { peer: handle, mtu } => {
                self.peer_table
                    .write()
                    .expect("peer table")
                    .set_mtu(&handle, mtu);
            }
            TransportEvent::Notify { peer: handle, bytes } => {
                self.peer_table
                    .write()
                    .expect("peer table")
                    .note_seen(&handle, now_ms);
                self.handle_inbound(&handle, &bytes, now_ms).await;
            }
            TransportEvent::DeviceDiscovered(discovered) => {
                tracing::debug!(
                    "discovered {} (rssi {:?})",
                    discovered.handle,
                    discovered.rssi
                );
            }
        }
    }

    async fn handle_inbound(&self, from_handle: &str, bytes: &[u8], now_ms: u64) {
        // Malformed packets are logged and dropped, never raised
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("undecodable packet from {}: {}", from_handle, e);
                return;
            }
        };

        let decision = self.router.lock().await.route(&packet, now_ms);
        match decision {
            RoutingDecision::Drop(reason) => {
                tracing::debug!("dropped packet from {}: {:?}", packet.sender, reason);
            }
            RoutingDecision::DeliverLocal => {
                self.deliver(&packet, from_handle, now_ms).await;
            }
            RoutingDecision::Forward(forwarded) => {
                self.forward(&forwarded, from_handle).await;
            }
            RoutingDecision::DeliverAndForward(forwarded) => {
                self.deliver(&packet, from_handle, now_ms).await;
                self.forward(&forwarded, from_handle).await;
            }
        }
    }

    async fn deliver(&self, packet: &Packet, from_handle: &str, now_ms: u64) {
        match packet.kind() {
            Some(kind) if kind.is_handshake() => {
                self.handle_handshake(packet, from_handle, now_ms).await;
            }
            Some(kind) if kind.is_fragment() => {
                self.handle_fragment(packet, from_handle, now_ms).await;
            }
            Some(MessageKind::ChatMessage) => {
                self.handle_chat(packet, from_handle, &packet.payload, now_ms)
                    .await;
            }
            Some(MessageKind::DeliveryAck) => {
                if let Some(ack) = DeliveryAck::decode(&packet.payload) {
                    self.hybrid
                        .note_confirmation(&ack.tx_id, &ack.confirmer)
                        .await;
                } else {
                    tracing::debug!("undecodable delivery ack from {}", packet.sender);
                }
            }
            Some(MessageKind::ReadReceipt) => {
                // Read receipts ride the same payload as delivery acks
                if let Some(ack) = DeliveryAck::decode(&packet.payload) {
                    tracing::debug!("read receipt for {} from {}", ack.tx_id, ack.confirmer);
                }
            }
            Some(MessageKind::PeerAnnouncement) => {
                self.handle_announcement(packet, from_handle).await;
            }
            Some(MessageKind::Ping) => {
                let pong = Packet::new(
                    MessageKind::Pong,
                    self.identity.peer_id(),
                    packet.payload.clone(),
                    now_ms,
                )
                .with_recipient(packet.sender)
                .with_ttl(1);
                self.write_packet(from_handle, &pong).await;
            }
            Some(MessageKind::Pong) => {
                tracing::debug!("pong from {}", packet.sender);
            }
            Some(MessageKind::SolanaTxRelay) => {
                self.handle_tx_relay(packet, from_handle, &packet.payload, now_ms)
                    .await;
            }
            Some(MessageKind::SolanaTxAck) => {
                if let Ok(ack) = serde_json::from_slice::<TxAckPayload>(&packet.payload) {
                    let _ = self.events_tx.send(MeshEvent::TxAckReceived {
                        envelope_id: ack.envelope_id,
                        from: packet.sender,
                    });
                }
            }
            Some(MessageKind::SolanaTxResult) => {
                if let Ok(result) = serde_json::from_slice::<TxResultPayload>(&packet.payload) {
                    let _ = self.events_tx.send(MeshEvent::TxResultReceived {
                        envelope_id: result.envelope_id,
                        signature: result.signature,
                        error: result.error,
                    });
                }
            }
            None => {
                // Unknown kind: forwarding already happened in the router,
                // there is nothing to interpret locally
                tracing::debug!(
                    "ignoring unknown message kind 0x{:02x} from {}",
                    packet.message_type,
                    packet.sender
                );
            }
            Some(_) => unreachable!("all MessageKind variants are handled by the guards above"),
        }
    }

    async fn handle_handshake(&self, packet: &Packet, from_handle: &str, now_ms: u64) {
        let response = {
            let mut sessions = self.sessions.lock().await;
            sessions.process_handshake(packet, now_ms)
        };
        match response {
            Ok(Some(reply)) => {
                self.write_packet(from_handle, &reply).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("handshake with {} failed: {}", packet.sender, e);
                return;
            }
        }

        let established = self.sessions.lock().await.has_session(&packet.sender);
        if established {
            self.peer_table.write().expect("peer table").bind_identity(
                from_handle,
                packet.sender,
                None,
            );
            let _ = self.events_tx.send(MeshEvent::SessionEstablished {
                peer: packet.sender,
            });
        }
    }

    async fn handle_fragment(&self, packet: &Packet, from_handle: &str, now_ms: u64) {
        let (header, chunk) = match FragmentHeader::decode(&packet.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("undecodable fragment from {}: {}", packet.sender, e);
                return;
            }
        };

        let completed = {
            let mut reassembler = self.reassembler.lock().await;
            reassembler.absorb(header, chunk, now_ms)
        };
        match completed {
            Ok(Some(payload)) => {
                // The reassembled bytes carry whatever the fragments did
                self.handle_chat(packet, from_handle, &payload, now_ms).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("reassembly aborted for {}: {}", packet.sender, e);
            }
        }
    }

    async fn handle_chat(
        &self,
        packet: &Packet,
        from_handle: &str,
        payload: &[u8],
        now_ms: u64,
    ) {
        let was_encrypted = packet.flags.is_encrypted();
        let plaintext = if was_encrypted {
            let mut sessions = self.sessions.lock().await;
            match sessions.decrypt(&packet.sender, payload) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    tracing::warn!("cannot decrypt frame from {}: {}", packet.sender, e);
                    return;
                }
            }
        } else {
            payload.to_vec()
        };

        // Chat payloads lead with a flags byte (<= 0x03); reassembled
        // relay envelopes are base64 text and can never start that low
        let looks_like_chat = plaintext.first().is_some_and(|b| *b <= 0x03);
        if !looks_like_chat {
            if let Ok(text) = std::str::from_utf8(&plaintext) {
                if let Ok(envelope) = DurableNonceEnvelope::from_base64(text) {
                    self.accept_envelope(envelope, packet, from_handle, now_ms)
                        .await;
                    return;
                }
            }
            tracing::debug!("unintelligible payload from {}", packet.sender);
            return;
        }

        match ChatMessage::decode(&plaintext) {
            Ok(message) => {
                // Directed messages get a delivery ack back to the sender
                if packet.recipient == Some(self.identity.peer_id()) {
                    let ack = DeliveryAck {
                        tx_id: message.id.clone(),
                        confirmer: self.identity.pubkey_base58(),
                    };
                    let ack_packet = Packet::new(
                        MessageKind::DeliveryAck,
                        self.identity.peer_id(),
                        ack.encode(),
                        now_ms,
                    )
                    .with_recipient(packet.sender)
                    .with_ttl(Router::optimal_ttl(self.peer_count()));
                    self.write_packet(from_handle, &ack_packet).await;
                }

                let _ = self.events_tx.send(MeshEvent::ChatReceived {
                    message,
                    from: packet.sender,
                    was_encrypted,
                });
            }
            Err(e) => {
                tracing::debug!("undecodable chat payload from {}: {}", packet.sender, e);
            }
        }
    }

    async fn handle_tx_relay(
        &self,
        packet: &Packet,
        from_handle: &str,
        payload: &[u8],
        now_ms: u64,
    ) {
        let Ok(text) = std::str::from_utf8(payload) else {
            tracing::debug!("tx relay payload is not utf-8");
            return;
        };
        match DurableNonceEnvelope::from_base64(text) {
            Ok(envelope) => {
                self.accept_envelope(envelope, packet, from_handle, now_ms)
                    .await;
            }
            Err(e) => tracing::debug!("bad relay envelope from {}: {}", packet.sender, e),
        }
    }

    async fn accept_envelope(
        &self,
        envelope: DurableNonceEnvelope,
        packet: &Packet,
        from_handle: &str,
        now_ms: u64,
    ) {
        if let Err(e) = envelope.verify() {
            tracing::warn!("rejected relay envelope from {}: {}", packet.sender, e);
            return;
        }

        let id = envelope_id(&envelope);
        tracing::info!("received relay envelope {} from {}", id, packet.sender);

        let ack = TxAckPayload { envelope_id: id };
        if let Ok(bytes) = serde_json::to_vec(&ack) {
            let ack_packet = Packet::new(
                MessageKind::SolanaTxAck,
                self.identity.peer_id(),
                bytes,
                now_ms,
            )
            .with_recipient(packet.sender)
            .with_ttl(Router::optimal_ttl(self.peer_count()));
            self.write_packet(from_handle, &ack_packet).await;
        }

        let _ = self.events_tx.send(MeshEvent::TxEnvelopeReceived {
            envelope,
            from: packet.sender,
        });
    }

    async fn handle_announcement(&self, packet: &Packet, from_handle: &str) {
        let Ok(announce) = serde_json::from_slice::<AnnouncePayload>(&packet.payload) else {
            tracing::debug!("undecodable announcement from {}", from_handle);
            return;
        };
        let Some(peer_id) = hex::decode(&announce.peer_id)
            .ok()
            .and_then(|bytes| PeerId::from_slice(&bytes))
        else {
            return;
        };

        self.peer_table.write().expect("peer table").bind_identity(
            from_handle,
            peer_id,
            Some(announce.nickname.clone()),
        );
        tracing::debug!("{} announced as {} ({})", from_handle, peer_id, announce.nickname);
        let _ = self.events_tx.send(MeshEvent::PeerAnnounced {
            peer: peer_id,
            pubkey_base58: announce.pubkey,
            nickname: announce.nickname,
        });
    }

    /// Announce our identity to a newly connected neighbor
    async fn send_announcement(&self, handle: &str) {
        let announce = AnnouncePayload {
            peer_id: self.identity.peer_id().to_hex(),
            pubkey: self.identity.pubkey_base58(),
            nickname: self.nickname.clone(),
        };
        let Ok(bytes) = serde_json::to_vec(&announce) else {
            return;
        };
        let packet = Packet::new(
            MessageKind::PeerAnnouncement,
            self.identity.peer_id(),
            bytes,
            self.clock.now_millis(),
        )
        .with_ttl(1);
        self.write_packet(handle, &packet).await;
    }

    /// Flood a relay envelope to every neighbor
    pub async fn relay_envelope(&self, envelope: &DurableNonceEnvelope) -> Result<String, crate::nonce::SolanaError> {
        let id = envelope_id(envelope);
        let encoded = envelope.to_base64()?;
        let now_ms = self.clock.now_millis();

        let fragmenter = Fragmenter::default();
        let packets = fragmenter.fragment_message(
            MessageKind::SolanaTxRelay,
            encoded.as_bytes(),
            self.identity.peer_id(),
            None,
            Router::optimal_ttl(self.peer_count()),
            &id,
            now_ms,
        );

        let handles = self.connected_handles();
        tracing::info!(
            "relaying envelope {} as {} packets to {} neighbors",
            id,
            packets.len(),
            handles.len()
        );
        for packet in &packets {
            self.router.lock().await.note_own_packet(packet);
            for handle in &handles {
                self.write_packet(handle, packet).await;
            }
        }
        Ok(id)
    }

    /// Broadcast a submission outcome back through the mesh
    pub async fn broadcast_tx_result(
        &self,
        envelope_id: &str,
        signature: Option<String>,
        error: Option<String>,
    ) {
        let payload = TxResultPayload {
            envelope_id: envelope_id.to_string(),
            signature,
            error,
        };
        let Ok(bytes) = serde_json::to_vec(&payload) else {
            return;
        };
        let packet = Packet::new(
            MessageKind::SolanaTxResult,
            self.identity.peer_id(),
            bytes,
            self.clock.now_millis(),
        )
        .with_ttl(Router::optimal_ttl(self.peer_count()));

        self.router.lock().await.note_own_packet(&packet);
        for handle in self.connected_handles() {
            self.write_packet(&handle, &packet).await;
        }
    }

    /// Kick off a Noise handshake with a connected peer
    pub async fn initiate_session(&self, peer: PeerId) -> Result<(), crate::noise::NoiseError> {
        let handle = self
            .peer_table
            .read()
            .expect("peer table")
            .handle_for(&peer);
        let Some(handle) = handle else {
            return Err(crate::noise::NoiseError::NoSession);
        };

        let packet = {
            let mut sessions = self.sessions.lock().await;
            sessions.initiate_handshake(peer, self.clock.now_millis())?
        };
        self.write_packet(&handle, &packet).await;
        Ok(())
    }

    async fn forward(&self, packet: &Packet, exclude_handle: &str) {
        let handles: Vec<String> = self
            .connected_handles()
            .into_iter()
            .filter(|handle| handle != exclude_handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        tracing::debug!(
            "forwarding packet from {} to {} neighbors (ttl {})",
            packet.sender,
            handles.len(),
            packet.ttl
        );
        for handle in handles {
            self.write_packet(&handle, packet).await;
        }
    }

    async fn write_packet(&self, handle: &str, packet: &Packet) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("cannot encode outbound packet: {}", e);
                return;
            }
        };
        if let Err(e) = self.transport.write(handle, &bytes).await {
            tracing::debug!("write to {} failed: {}", handle, e);
        }
    }

    fn connected_handles(&self) -> Vec<String> {
        self.peer_table.read().expect("peer table").handles()
    }

    fn peer_count(&self) -> usize {
        self.peer_table.read().expect("peer table").len()
    }

    /// Periodic upkeep across every owned component
    async fn maintain(&self) {
        let now_ms = self.clock.now_millis();
        self.router.lock().await.maintain(now_ms);
        self.reassembler.lock().await.purge_expired(now_ms);
        self.sessions.lock().await.maintain(now_ms);
        self.hybrid.maintain().await;

        let expired = self.peer_table.write().expect("peer table").expire(now_ms);
        for entry in expired {
            tracing::debug!("peer {} expired from table", entry.handle);
            if let Some(peer_id) = entry.peer_id {
                self.sessions.lock().await.remove_session(&peer_id);
            }
            let _ = self.events_tx.send(MeshEvent::PeerDisconnected {
                handle: entry.handle,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_table_bind_and_lookup() {
        let mut table = PeerTable::default();
        table.upsert("handle-1", 100);
        let peer = PeerId::new([5; 8]);
        table.bind_identity("handle-1", peer, Some("bob".to_string()));

        assert_eq!(table.handle_for(&peer), Some("handle-1".to_string()));
        assert_eq!(table.handle_for(&PeerId::new([6; 8])), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_peer_table_expiry() {
        let mut table = PeerTable::default();
        table.upsert("old", 0);
        table.upsert("fresh", PEER_EXPIRY_MS - 1);

        let expired = table.expire(PEER_EXPIRY_MS);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, "old");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_note_seen_defers_expiry() {
        let mut table = PeerTable::default();
        table.upsert("peer", 0);
        table.note_seen("peer", PEER_EXPIRY_MS - 1);
        assert!(table.expire(PEER_EXPIRY_MS).is_empty());
    }

    #[test]
    fn test_envelope_id_stable() {
        let envelope = DurableNonceEnvelope {
            nonce_account: "acc".to_string(),
            nonce_value: "val".to_string(),
            authority: "auth".to_string(),
            serialized_tx: vec![1, 2, 3],
            created_at: 0,
        };
        assert_eq!(envelope_id(&envelope), envelope_id(&envelope.clone()));
        assert_eq!(envelope_id(&envelope).len(), 16);
    }
}
