//! End-to-end mesh scenarios over the in-memory transport

use murmurnet::clock::ManualClock;
use murmurnet::identity::NodeIdentity;
use murmurnet::mesh::MeshEvent;
use murmurnet::nonce::CachedNonceValue;
use murmurnet::protocol::PeerId;
use murmurnet::relay::MemoryRelayPool;
use murmurnet::store::MemorySecureStore;
use murmurnet::transport::MemoryTransport;
use murmurnet::{MurmurNetError, MurmurNetSDK};
use solana_sdk::hash::Hash;
use solana_sdk::signature::Signer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

struct Node {
    sdk: MurmurNetSDK,
    transport: Arc<MemoryTransport>,
    events: broadcast::Receiver<MeshEvent>,
}

async fn spawn_node(name: &str) -> Node {
    let transport = MemoryTransport::new(name, 512);
    let sdk = MurmurNetSDK::new(
        NodeIdentity::generate(),
        name,
        transport.clone(),
        Arc::new(MemoryRelayPool::new(2)),
        Arc::new(MemorySecureStore::new()),
    )
    .expect("sdk assembles");
    let events = sdk.events();
    sdk.start().await.expect("sdk starts");
    Node {
        sdk,
        transport,
        events,
    }
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<MeshEvent>,
    mut filter: impl FnMut(MeshEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if let Some(value) = filter(event) {
                return value;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn announced_peer(event: MeshEvent) -> Option<PeerId> {
    match event {
        MeshEvent::PeerAnnounced { peer, .. } => Some(peer),
        _ => None,
    }
}

#[tokio::test]
async fn test_single_hop_chat() {
    let mut alice = spawn_node("alice-radio").await;
    let mut bob = spawn_node("bob-radio").await;
    MemoryTransport::link(&alice.transport, &bob.transport).await;

    wait_for(&mut alice.events, announced_peer).await;
    wait_for(&mut bob.events, announced_peer).await;

    let receipt = alice
        .sdk
        .send_message("hi", "alice", None, None, false)
        .await
        .unwrap();
    assert!(receipt.sent_via_ble);
    assert_eq!(receipt.ble_peer_count, 1);

    let (message, from) = wait_for(&mut bob.events, |event| match event {
        MeshEvent::ChatReceived { message, from, .. } => Some((message, from)),
        _ => None,
    })
    .await;
    assert_eq!(message.content, "hi");
    assert_eq!(message.sender, "alice");
    assert_eq!(from, alice.sdk.peer_id());
}

#[tokio::test]
async fn test_two_hop_broadcast_with_dedup() {
    // Diamond: alice reaches bob only through two relays
    let mut alice = spawn_node("a-radio").await;
    let relay1 = spawn_node("r1-radio").await;
    let relay2 = spawn_node("r2-radio").await;
    let mut bob = spawn_node("b-radio").await;

    MemoryTransport::link(&alice.transport, &relay1.transport).await;
    MemoryTransport::link(&alice.transport, &relay2.transport).await;
    MemoryTransport::link(&relay1.transport, &bob.transport).await;
    MemoryTransport::link(&relay2.transport, &bob.transport).await;

    // Let every node process its connection events
    wait_for(&mut alice.events, announced_peer).await;
    wait_for(&mut bob.events, announced_peer).await;
    sleep(Duration::from_millis(200)).await;

    alice
        .sdk
        .send_message("flood me", "alice", None, None, false)
        .await
        .unwrap();

    let message = wait_for(&mut bob.events, |event| match event {
        MeshEvent::ChatReceived { message, .. } => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message.content, "flood me");

    // The second copy through the other relay is suppressed
    sleep(Duration::from_millis(300)).await;
    let mut extra_chats = 0;
    while let Ok(event) = bob.events.try_recv() {
        if matches!(event, MeshEvent::ChatReceived { .. }) {
            extra_chats += 1;
        }
    }
    assert_eq!(extra_chats, 0, "duplicate broadcast reached the app");

    let stats = bob.sdk.router_stats().await;
    assert!(stats.dropped_duplicate >= 1, "router never saw the duplicate");
}

#[tokio::test]
async fn test_fragmented_chat_reassembles() {
    let mut alice = spawn_node("frag-a").await;
    let mut bob = spawn_node("frag-b").await;
    MemoryTransport::link(&alice.transport, &bob.transport).await;
    wait_for(&mut alice.events, announced_peer).await;
    wait_for(&mut bob.events, announced_peer).await;

    let long_content: String = (0..3_000).map(|i| ((i % 26) as u8 + b'a') as char).collect();
    alice
        .sdk
        .send_message(long_content.clone(), "alice", None, None, false)
        .await
        .unwrap();

    let message = wait_for(&mut bob.events, |event| match event {
        MeshEvent::ChatReceived { message, .. } => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message.content.len(), 3_000);
    assert_eq!(message.content, long_content);
}

#[tokio::test]
async fn test_noise_session_and_encrypted_delivery() {
    let mut alice = spawn_node("noise-a").await;
    let mut bob = spawn_node("noise-b").await;
    MemoryTransport::link(&alice.transport, &bob.transport).await;

    let bob_peer = wait_for(&mut alice.events, announced_peer).await;
    wait_for(&mut bob.events, announced_peer).await;

    alice.sdk.initiate_session(bob_peer).await.unwrap();
    wait_for(&mut alice.events, |event| match event {
        MeshEvent::SessionEstablished { peer } => Some(peer),
        _ => None,
    })
    .await;
    assert!(alice.sdk.has_session(&bob_peer).await);

    let receipt = alice
        .sdk
        .send_message("between us", "alice", Some(bob_peer), None, false)
        .await
        .unwrap();

    let (message, was_encrypted) = wait_for(&mut bob.events, |event| match event {
        MeshEvent::ChatReceived {
            message,
            was_encrypted,
            ..
        } => Some((message, was_encrypted)),
        _ => None,
    })
    .await;
    assert!(was_encrypted, "directed message left plaintext");
    assert_eq!(message.content, "between us");

    // Bob's delivery ack lands in the receipt
    let confirmed = alice
        .sdk
        .wait_for_confirmation(&receipt.tx_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        confirmed.confirmations,
        vec![bob.sdk.identity().pubkey_base58()]
    );
}

#[tokio::test]
async fn test_nostr_fallback_when_mesh_is_empty() {
    let alice = spawn_node("lonely").await;

    let receipt = alice
        .sdk
        .send_message("anyone out there", "alice", None, None, true)
        .await
        .unwrap();
    assert!(!receipt.sent_via_ble);
    assert!(receipt.sent_via_nostr);
    assert_eq!(receipt.nostr_relay_count, 2);
}

#[tokio::test]
async fn test_daily_rate_limit_at_sdk_surface() {
    let transport = MemoryTransport::new("limited", 512);
    let clock = Arc::new(ManualClock::new(1_710_057_600_000));
    let sdk = MurmurNetSDK::with_clock(
        NodeIdentity::generate(),
        "limited",
        transport,
        Arc::new(MemoryRelayPool::new(1)),
        Arc::new(MemorySecureStore::new()),
        clock.clone(),
    )
    .unwrap();

    for _ in 0..3 {
        sdk.send_message("ping", "limited", None, None, false)
            .await
            .unwrap();
    }
    let denied = sdk
        .send_message("one too many", "limited", None, None, false)
        .await;
    assert!(matches!(denied, Err(MurmurNetError::RateLimited)));

    let status = sdk.rate_limit_status().unwrap();
    assert_eq!(status.remaining, 0);
    assert!(!status.unlocked);

    // Midnight UTC resets the counter
    clock.advance(24 * 60 * 60 * 1000);
    sdk.send_message("new day", "limited", None, None, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_envelope_relays_across_the_mesh() {
    let mut alice = spawn_node("env-a").await;
    let mut bob = spawn_node("env-b").await;
    MemoryTransport::link(&alice.transport, &bob.transport).await;
    wait_for(&mut alice.events, announced_peer).await;
    wait_for(&mut bob.events, announced_peer).await;

    // Offline-built transfer against cached nonce data
    let cached = CachedNonceValue {
        nonce_account: solana_sdk::pubkey::Pubkey::new_unique().to_string(),
        authority: alice.sdk.identity().pubkey_base58(),
        nonce_value: Hash::new_unique().to_string(),
        fetched_at: 0,
        used: false,
    };
    let recipient = solana_sdk::pubkey::Pubkey::new_unique();
    let envelope = alice
        .sdk
        .create_offline_transfer(recipient, 100_000_000, None, &cached)
        .unwrap();

    let envelope_id = alice.sdk.relay_envelope(&envelope).await.unwrap();

    let (received, from) = wait_for(&mut bob.events, |event| match event {
        MeshEvent::TxEnvelopeReceived { envelope, from } => Some((envelope, from)),
        _ => None,
    })
    .await;
    assert_eq!(from, alice.sdk.peer_id());
    assert_eq!(received.nonce_value, cached.nonce_value);
    received.verify().unwrap();
    received.transaction().unwrap().verify().unwrap();

    // Bob's relay ack makes it back to the origin
    let acked_id = wait_for(&mut alice.events, |event| match event {
        MeshEvent::TxAckReceived { envelope_id, .. } => Some(envelope_id),
        _ => None,
    })
    .await;
    assert_eq!(acked_id, envelope_id);

    // The transfer goes to a third key, not the relaying peer
    assert_ne!(bob.sdk.identity().keypair().pubkey(), recipient);
}
