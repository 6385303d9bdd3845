//! murmurnet demonstration
//!
//! Wires two in-memory nodes together, walks through discovery, a Noise
//! handshake, an encrypted chat exchange and an offline transaction
//! envelope relayed across the mesh.

use anyhow::Result;
use murmurnet::identity::NodeIdentity;
use murmurnet::mesh::MeshEvent;
use murmurnet::nonce::CachedNonceValue;
use murmurnet::relay::MemoryRelayPool;
use murmurnet::store::MemorySecureStore;
use murmurnet::transport::MemoryTransport;
use murmurnet::MurmurNetSDK;
use solana_sdk::hash::Hash;
use solana_sdk::signature::Signer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("starting murmurnet demonstration");

    // Two nodes on an in-memory "radio"
    let transport_a = MemoryTransport::new("node-a", 512);
    let transport_b = MemoryTransport::new("node-b", 512);

    let alice_identity = NodeIdentity::generate();
    let bob_identity = NodeIdentity::generate();
    let bob_pubkey = bob_identity.keypair().pubkey();

    let alice = MurmurNetSDK::new(
        alice_identity,
        "alice",
        transport_a.clone(),
        Arc::new(MemoryRelayPool::new(2)),
        Arc::new(MemorySecureStore::new()),
    )?;
    let bob = MurmurNetSDK::new(
        bob_identity,
        "bob",
        transport_b.clone(),
        Arc::new(MemoryRelayPool::new(2)),
        Arc::new(MemorySecureStore::new()),
    )?;

    let mut alice_events = alice.events();
    let mut bob_events = bob.events();

    let _worker_a = alice.start().await?;
    let _worker_b = bob.start().await?;

    // Bring the "connection" up; both sides announce themselves
    MemoryTransport::link(&transport_a, &transport_b).await;

    let bob_peer_id = wait_for_announcement(&mut alice_events).await?;
    info!("alice discovered bob as {}", bob_peer_id);

    // Authenticated session before any private chat
    alice.initiate_session(bob_peer_id).await?;
    wait_for_session(&mut alice_events).await?;
    info!("noise session established");

    let receipt = alice
        .send_message(
            "hey bob, first hop works",
            "alice",
            Some(bob_peer_id),
            None,
            false,
        )
        .await?;
    info!(
        "alice sent {} via {:?} ({} peers)",
        receipt.tx_id, receipt.delivery_method, receipt.ble_peer_count
    );

    match wait_for_chat(&mut bob_events).await {
        Ok((message, encrypted)) => {
            info!(
                "bob received '{}' from {} (encrypted: {})",
                message.content, message.sender, encrypted
            );
        }
        Err(e) => error!("chat never arrived: {}", e),
    }

    let confirmed = alice
        .wait_for_confirmation(&receipt.tx_id, Duration::from_secs(5))
        .await?;
    info!(
        "delivery confirmations for {}: {:?}",
        confirmed.tx_id, confirmed.confirmations
    );

    // Offline envelope: fabricated nonce data stands in for
    // prepare_cached_nonce() against a live RPC endpoint
    let cached = CachedNonceValue {
        nonce_account: solana_sdk::pubkey::Pubkey::new_unique().to_string(),
        authority: alice.identity().pubkey_base58(),
        nonce_value: Hash::new_unique().to_string(),
        fetched_at: 0,
        used: false,
    };
    let envelope =
        alice.create_offline_transfer(bob_pubkey, 100_000_000, Some("demo".into()), &cached)?;
    let envelope_id = alice.relay_envelope(&envelope).await?;
    info!("alice relayed envelope {}", envelope_id);

    match wait_for_envelope(&mut bob_events).await {
        Ok(from) => {
            info!(
                "bob holds the envelope from {}; an online relay would submit it now",
                from
            );
        }
        Err(e) => error!("envelope never arrived: {}", e),
    }

    let stats = alice.router_stats().await;
    info!(
        "alice router: {} processed, {} delivered, {} forwarded",
        stats.processed, stats.delivered, stats.forwarded
    );

    info!("demonstration complete");
    Ok(())
}

async fn wait_for_announcement(
    events: &mut broadcast::Receiver<MeshEvent>,
) -> Result<murmurnet::protocol::PeerId> {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, events.recv()).await?? {
            MeshEvent::PeerAnnounced { peer, .. } => return Ok(peer),
            _ => continue,
        }
    }
}

async fn wait_for_session(
    events: &mut broadcast::Receiver<MeshEvent>,
) -> Result<()> {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, events.recv()).await?? {
            MeshEvent::SessionEstablished { .. } => return Ok(()),
            _ => continue,
        }
    }
}

async fn wait_for_chat(
    events: &mut broadcast::Receiver<MeshEvent>,
) -> Result<(murmurnet::protocol::ChatMessage, bool)> {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, events.recv()).await?? {
            MeshEvent::ChatReceived {
                message,
                was_encrypted,
                ..
            } => return Ok((message, was_encrypted)),
            _ => continue,
        }
    }
}

async fn wait_for_envelope(
    events: &mut broadcast::Receiver<MeshEvent>,
) -> Result<murmurnet::protocol::PeerId> {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, events.recv()).await?? {
            MeshEvent::TxEnvelopeReceived { from, .. } => return Ok(from),
            _ => continue,
        }
    }
}
