//! murmurnet - peer-to-peer messaging and value transfer over a BLE mesh
//!
//! Chat and Solana transactions travel hop-by-hop between nearby devices,
//! with a Nostr relay fallback when the internet is reachable and durable
//! nonce envelopes so transactions signed offline survive until any
//! online relay submits them.

pub mod clock;
pub mod identity;
pub mod mesh;
pub mod noise;
pub mod nonce;
pub mod protocol;
pub mod ratelimit;
pub mod relay;
pub mod send;
pub mod store;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use clock::{Clock, SystemClock};
use identity::NodeIdentity;
use mesh::{MeshEvent, MeshService};
use noise::SessionManager;
use nonce::{CachedNonceValue, DurableNonceEnvelope, DurableNonceManager};
use protocol::PeerId;
use ratelimit::{RateLimitStatus, RateLimitStore};
use relay::NostrRelayPool;
use send::{HybridSend, Receipt, SendRequest};
use store::SecureStore;
use transport::BleTransport;

/// Service UUID advertised for mesh discovery
pub const MURMURNET_SERVICE_UUID: &str = "4d4e5254-9c1a-4e62-90ab-53c7f2b81c0d";

/// Human-readable service name
pub const MURMURNET_SERVICE_NAME: &str = "MurmurNet";

/// Characteristic carrying mesh packets
pub const MURMURNET_PACKET_CHARACTERISTIC: &str = "4d4e5254-9c1a-4e62-90ab-53c7f2b81c0e";

/// Error types for murmurnet operations
#[derive(Error, Debug)]
pub enum MurmurNetError {
    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("fragmentation error: {0}")]
    Fragment(#[from] protocol::fragment::FragmentError),

    #[error("noise error: {0}")]
    Noise(#[from] noise::NoiseError),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("nostr error: {0}")]
    Nostr(#[from] relay::NostrError),

    #[error("solana error: {0}")]
    Solana(#[from] nonce::SolanaError),

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("send error: {0}")]
    Send(#[from] send::SendError),

    #[error("identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("daily message limit reached")]
    RateLimited,
}

/// Core murmurnet SDK instance
///
/// Owns the session table, the mesh worker, the hybrid send coordinator
/// and the durable nonce manager; the host app supplies the transport,
/// the relay pool and the secure store.
pub struct MurmurNetSDK {
    identity: Arc<NodeIdentity>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SecureStore>,
    sessions: Arc<Mutex<SessionManager>>,
    transport: Arc<dyn BleTransport>,
    hybrid: Arc<HybridSend>,
    mesh: Arc<MeshService>,
    nonce_manager: Arc<DurableNonceManager>,
    rate_limits: RateLimitStore,
}

impl MurmurNetSDK {
    /// Assemble an SDK instance over host-provided collaborators
    pub fn new(
        identity: NodeIdentity,
        nickname: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        relay_pool: Arc<dyn NostrRelayPool>,
        store: Arc<dyn SecureStore>,
    ) -> Result<Self, MurmurNetError> {
        Self::with_clock(
            identity,
            nickname,
            transport,
            relay_pool,
            store,
            Arc::new(SystemClock),
        )
    }

    /// Variant with an injected clock, used by tests
    pub fn with_clock(
        identity: NodeIdentity,
        nickname: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        relay_pool: Arc<dyn NostrRelayPool>,
        store: Arc<dyn SecureStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MurmurNetError> {
        let identity = Arc::new(identity);
        let sessions = Arc::new(Mutex::new(SessionManager::new(
            identity.peer_id(),
            store.as_ref(),
        )?));

        let hybrid = HybridSend::new(
            Arc::clone(&identity),
            Arc::clone(&transport),
            Arc::clone(&relay_pool),
            Arc::clone(&sessions),
            Arc::clone(&clock),
        );

        let mesh = MeshService::new(
            Arc::clone(&identity),
            nickname.into(),
            Arc::clone(&transport),
            Arc::clone(&sessions),
            Arc::clone(&hybrid),
            Arc::clone(&clock),
        );

        let nonce_manager = Arc::new(DurableNonceManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let rate_limits = RateLimitStore::new(Arc::clone(&store), Arc::clone(&clock));

        tracing::info!(
            "murmurnet SDK assembled for {} ({})",
            identity.peer_id(),
            identity.pubkey_base58()
        );

        Ok(Self {
            identity,
            clock,
            store,
            sessions,
            transport,
            hybrid,
            mesh,
            nonce_manager,
            rate_limits,
        })
    }

    /// Point the nonce manager at a Solana RPC endpoint
    #[cfg(feature = "rpc-client")]
    pub fn with_rpc(mut self, rpc_url: &str) -> Self {
        self.nonce_manager = Arc::new(
            DurableNonceManager::new(Arc::clone(&self.store), Arc::clone(&self.clock))
                .with_rpc(rpc_url),
        );
        self
    }

    /// Start the mesh worker and background subscriptions
    pub async fn start(&self) -> Result<tokio::task::JoinHandle<()>, MurmurNetError> {
        // Peer lookups for the directed-send fast path
        let table = self.mesh.peer_table();
        self.hybrid
            .set_reachability_probe(Box::new(move |peer| {
                table.read().ok().and_then(|table| table.handle_for(peer))
            }))
            .await;
        self.hybrid.spawn_nostr_receipt_listener();

        let worker = self.mesh.run();

        self.transport
            .start_advertise(
                MURMURNET_SERVICE_UUID,
                &[MURMURNET_PACKET_CHARACTERISTIC.to_string()],
            )
            .await?;
        self.transport.start_scan().await?;

        tracing::info!("murmurnet networking started");
        Ok(worker)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Subscribe to mesh events (chat, peers, sessions, tx relay)
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<MeshEvent> {
        self.mesh.events()
    }

    /// Send a message, BLE first with Nostr fallback
    ///
    /// Denied with `RateLimited` once the daily budget is spent and no
    /// transaction has unlocked the day.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        nickname: impl Into<String>,
        recipient: Option<PeerId>,
        recipient_nostr_pubkey: Option<String>,
        has_internet: bool,
    ) -> Result<Receipt, MurmurNetError> {
        let sender = self.identity.pubkey_base58();
        if !self.rate_limits.record_send(&sender)? {
            return Err(MurmurNetError::RateLimited);
        }

        let receipt = self
            .hybrid
            .execute(SendRequest {
                content: content.into(),
                sender_nickname: nickname.into(),
                recipient,
                recipient_nostr_pubkey,
                tx_id: None,
                has_internet,
            })
            .await?;
        Ok(receipt)
    }

    /// Wait for the first delivery confirmation of a sent message
    pub async fn wait_for_confirmation(
        &self,
        tx_id: &str,
        timeout: Duration,
    ) -> Result<Receipt, MurmurNetError> {
        Ok(self.hybrid.wait_for_confirmation(tx_id, timeout).await?)
    }

    /// Current rate-limit standing for this identity
    pub fn rate_limit_status(&self) -> Result<RateLimitStatus, MurmurNetError> {
        Ok(self.rate_limits.status(&self.identity.pubkey_base58())?)
    }

    /// Begin a Noise handshake with an announced peer
    pub async fn initiate_session(&self, peer: PeerId) -> Result<(), MurmurNetError> {
        Ok(self.mesh.initiate_session(peer).await?)
    }

    /// Whether an authenticated session exists with a peer
    pub async fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.lock().await.has_session(peer)
    }

    /// Build and sign an offline transfer against cached nonce data
    pub fn create_offline_transfer(
        &self,
        to: solana_sdk::pubkey::Pubkey,
        lamports: u64,
        memo: Option<String>,
        cached: &CachedNonceValue,
    ) -> Result<DurableNonceEnvelope, MurmurNetError> {
        let from = solana_sdk::pubkey::Pubkey::new_from_array(self.identity.public_key_bytes());
        let tx = self
            .nonce_manager
            .build_transfer_from_cache(from, to, lamports, memo, cached)?;
        let envelope = self
            .nonce_manager
            .sign_envelope(tx, &[self.identity.keypair()])?;
        Ok(envelope)
    }

    /// Flood a signed envelope to the mesh for some online relay to submit
    pub async fn relay_envelope(
        &self,
        envelope: &DurableNonceEnvelope,
    ) -> Result<String, MurmurNetError> {
        Ok(self.mesh.relay_envelope(envelope).await?)
    }

    /// Access the durable nonce manager directly
    pub fn nonce_manager(&self) -> &Arc<DurableNonceManager> {
        &self.nonce_manager
    }

    /// Router counters for diagnostics
    pub async fn router_stats(&self) -> protocol::RouterStats {
        self.mesh.router_stats().await
    }
}

#[cfg(feature = "rpc-client")]
impl MurmurNetSDK {
    /// Create and persist a durable nonce account for this identity
    pub async fn create_nonce_account(&self) -> Result<solana_sdk::pubkey::Pubkey, MurmurNetError> {
        Ok(self
            .nonce_manager
            .create_nonce_account(self.identity.keypair(), nonce::NONCE_FUNDING_LAMPORTS)
            .await?)
    }

    /// Snapshot the current nonce value for later offline use
    pub async fn prepare_cached_nonce(
        &self,
        nonce_account: &solana_sdk::pubkey::Pubkey,
    ) -> Result<CachedNonceValue, MurmurNetError> {
        Ok(self.nonce_manager.prepare_cached_nonce(nonce_account).await?)
    }

    /// Submit a relayed envelope and report the outcome to the mesh
    ///
    /// A successful submission also unlocks today's rate limit for this
    /// identity.
    pub async fn submit_envelope(
        &self,
        envelope: &DurableNonceEnvelope,
    ) -> Result<String, MurmurNetError> {
        let id = mesh::envelope_id(envelope);
        match self.nonce_manager.submit(envelope).await {
            Ok(signature) => {
                let signature = signature.to_string();
                if let Err(e) = self.rate_limits.unlock_today(&self.identity.pubkey_base58()) {
                    tracing::warn!("could not unlock rate limit: {}", e);
                }
                self.mesh
                    .broadcast_tx_result(&id, Some(signature.clone()), None)
                    .await;
                Ok(signature)
            }
            Err(e) => {
                self.mesh
                    .broadcast_tx_result(&id, None, Some(e.to_string()))
                    .await;
                Err(e.into())
            }
        }
    }
}
