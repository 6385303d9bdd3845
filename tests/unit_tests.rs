//! Component-level tests against the murmurnet public API

mod codec_tests {
    use murmurnet::protocol::{CodecError, MessageKind, Packet, PeerId};

    #[test]
    fn test_single_hop_chat_packet_is_one_block() {
        // A five-byte payload still pads out to the smallest block
        let packet = Packet::new(
            MessageKind::ChatMessage,
            PeerId::new(*b"AAAAAAAA"),
            b"hi".to_vec(),
            1_700_000_000_000,
        );
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), 256);

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.sender, PeerId::new(*b"AAAAAAAA"));
        assert_eq!(decoded.payload, b"hi");
    }

    #[test]
    fn test_every_block_size_reachable() {
        for (payload, expected) in [(100, 256), (400, 512), (900, 1024), (1900, 2048)] {
            let packet = Packet::new(
                MessageKind::ChatMessage,
                PeerId::new([1; 8]),
                vec![7; payload],
                0,
            );
            assert_eq!(packet.encode().unwrap().len(), expected);
        }
    }

    #[test]
    fn test_round_trip_preserves_all_header_fields() {
        let packet = Packet::new(
            MessageKind::SolanaTxRelay,
            PeerId::new([3; 8]),
            vec![9; 333],
            123_456_789,
        )
        .with_recipient(PeerId::BROADCAST)
        .with_ttl(7);

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.version, packet.version);
        assert_eq!(decoded.message_type, packet.message_type);
        assert_eq!(decoded.ttl, 7);
        assert_eq!(decoded.timestamp_ms, 123_456_789);
        assert_eq!(decoded.recipient, Some(PeerId::BROADCAST));
        assert!(decoded.is_broadcast());
    }

    #[test]
    fn test_padding_depends_only_on_packet() {
        let make = || {
            Packet::new(
                MessageKind::ChatMessage,
                PeerId::new([2; 8]),
                b"deterministic".to_vec(),
                42,
            )
        };
        assert_eq!(make().encode().unwrap(), make().encode().unwrap());
    }

    #[test]
    fn test_oversize_payload_refused() {
        let packet = Packet::new(
            MessageKind::ChatMessage,
            PeerId::new([1; 8]),
            vec![0; 70_000],
            0,
        );
        assert_eq!(packet.encode(), Err(CodecError::PayloadTooLarge));
    }
}

mod bloom_tests {
    use murmurnet::protocol::BloomSet;

    #[test]
    fn test_dedup_never_forgets_within_lifetime() {
        let mut bloom = BloomSet::new(5_000, 0.01);
        let fingerprints: Vec<String> = (0..5_000)
            .map(|i| format!("aabbccdd:{}:deadbeefcafebabe", i))
            .collect();

        for fp in &fingerprints {
            assert!(!bloom.contains(fp.as_bytes()));
            bloom.add(fp.as_bytes());
        }
        for fp in &fingerprints {
            assert!(bloom.contains(fp.as_bytes()));
        }
    }

    #[test]
    fn test_false_positives_within_twice_target() {
        let mut bloom = BloomSet::new(2_000, 0.01);
        for i in 0..2_000u32 {
            bloom.add(&i.to_be_bytes());
        }
        let hits = (10_000u32..30_000)
            .filter(|i| bloom.contains(&i.to_be_bytes()))
            .count();
        // 20k probes at p=0.01 with 2x headroom
        assert!(hits <= 400, "{hits} false positives");
    }
}

mod fragment_tests {
    use murmurnet::protocol::{FragmentHeader, Fragmenter, MessageKind, PeerId, Reassembler};

    #[test]
    fn test_round_trip_across_mtus() {
        for mtu in [200, 247, 512, 1024] {
            let fragmenter = Fragmenter::new(mtu);
            let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
            let packets = fragmenter.fragment_message(
                MessageKind::ChatMessage,
                &payload,
                PeerId::new([1; 8]),
                None,
                5,
                "round-trip",
                0,
            );

            let mut reassembler = Reassembler::new();
            let mut out = None;
            for packet in &packets {
                let (header, chunk) = FragmentHeader::decode(&packet.payload).unwrap();
                out = reassembler.absorb(header, chunk, 0).unwrap();
            }
            assert_eq!(out.expect("reassembled"), payload, "mtu {mtu}");
        }
    }

    #[test]
    fn test_three_kb_at_default_mtu_is_at_most_nine_fragments() {
        let fragmenter = Fragmenter::default();
        let payload = vec![0x5A; 3_000];
        let packets = fragmenter.fragment_message(
            MessageKind::ChatMessage,
            &payload,
            PeerId::new([1; 8]),
            None,
            5,
            "8e2f1ab0-34cd-4be1-9f00-1f2e3d4c5b6a",
            0,
        );
        assert!(packets.len() >= 2);
        assert!(packets.len() <= 9, "got {}", packets.len());
    }

    #[test]
    fn test_scrambled_arrival_order() {
        let fragmenter = Fragmenter::default();
        let payload: Vec<u8> = (0..3_000u32).map(|i| (i % 89) as u8).collect();
        let mut packets = fragmenter.fragment_message(
            MessageKind::ChatMessage,
            &payload,
            PeerId::new([1; 8]),
            None,
            5,
            "scrambled",
            0,
        );
        packets.reverse();
        packets.swap(1, 4);
        packets.swap(0, 2);

        let mut reassembler = Reassembler::new();
        let mut out = None;
        for packet in &packets {
            let (header, chunk) = FragmentHeader::decode(&packet.payload).unwrap();
            out = reassembler.absorb(header, chunk, 0).unwrap();
        }
        assert_eq!(out.unwrap(), payload);
    }

    #[test]
    fn test_dropped_fragment_yields_nothing_and_purges() {
        use murmurnet::protocol::fragment::REASSEMBLY_TIMEOUT_MS;

        let fragmenter = Fragmenter::default();
        let payload = vec![1u8; 3_000];
        let packets = fragmenter.fragment_message(
            MessageKind::ChatMessage,
            &payload,
            PeerId::new([1; 8]),
            None,
            5,
            "lossy",
            1_000,
        );

        let mut reassembler = Reassembler::new();
        for (i, packet) in packets.iter().enumerate() {
            if i == 4 {
                continue;
            }
            let (header, chunk) = FragmentHeader::decode(&packet.payload).unwrap();
            assert!(reassembler.absorb(header, chunk, 1_000).unwrap().is_none());
        }

        assert_eq!(reassembler.incomplete_count(), 1);
        reassembler.purge_expired(1_000 + REASSEMBLY_TIMEOUT_MS);
        assert_eq!(reassembler.incomplete_count(), 0);
    }
}

mod noise_tests {
    use murmurnet::noise::SessionManager;
    use murmurnet::protocol::PeerId;
    use murmurnet::store::MemorySecureStore;

    #[test]
    fn test_transport_frames_across_many_counters() {
        let store_a = MemorySecureStore::new();
        let store_b = MemorySecureStore::new();
        let peer_a = PeerId::new([1; 8]);
        let peer_b = PeerId::new([2; 8]);
        let mut a = SessionManager::new(peer_a, &store_a).unwrap();
        let mut b = SessionManager::new(peer_b, &store_b).unwrap();

        let init = a.initiate_handshake(peer_b, 0).unwrap();
        let response = b.process_handshake(&init, 0).unwrap().unwrap();
        let fin = a.process_handshake(&response, 0).unwrap().unwrap();
        assert!(b.process_handshake(&fin, 0).unwrap().is_none());

        for i in 0..200u32 {
            let plaintext = format!("ordered frame {i}");
            let frame = a.encrypt(&peer_b, plaintext.as_bytes()).unwrap();
            assert_eq!(b.decrypt(&peer_a, &frame).unwrap(), plaintext.as_bytes());
        }
    }

    #[test]
    fn test_cross_session_frames_rejected() {
        let peer_a = PeerId::new([1; 8]);
        let peer_b = PeerId::new([2; 8]);
        let peer_c = PeerId::new([3; 8]);

        let store_a = MemorySecureStore::new();
        let store_b = MemorySecureStore::new();
        let store_c = MemorySecureStore::new();
        let mut a = SessionManager::new(peer_a, &store_a).unwrap();
        let mut b = SessionManager::new(peer_b, &store_b).unwrap();
        let mut c = SessionManager::new(peer_c, &store_c).unwrap();

        let init = a.initiate_handshake(peer_b, 0).unwrap();
        let response = b.process_handshake(&init, 0).unwrap().unwrap();
        let fin = a.process_handshake(&response, 0).unwrap().unwrap();
        b.process_handshake(&fin, 0).unwrap();

        let init = a.initiate_handshake(peer_c, 0).unwrap();
        let response = c.process_handshake(&init, 0).unwrap().unwrap();
        let fin = a.process_handshake(&response, 0).unwrap().unwrap();
        c.process_handshake(&fin, 0).unwrap();

        // A frame for b cannot decrypt on c's session
        let frame = a.encrypt(&peer_b, b"for bob only").unwrap();
        assert!(c.decrypt(&peer_a, &frame).is_err());
    }
}

mod receipt_tests {
    use murmurnet::send::{DeliveryMethod, Receipt};

    #[test]
    fn test_channels_never_regress() {
        let mut receipt = Receipt::new("tx".into(), 0);
        assert_eq!(receipt.delivery_method, DeliveryMethod::None);

        receipt.mark_ble(2);
        assert_eq!(receipt.delivery_method, DeliveryMethod::Ble);
        receipt.mark_nostr(4);
        assert_eq!(receipt.delivery_method, DeliveryMethod::Both);

        receipt.mark_ble(0);
        assert!(receipt.sent_via_ble);
        assert_eq!(receipt.ble_peer_count, 2);
    }

    #[test]
    fn test_confirmations_append_only_unique() {
        let mut receipt = Receipt::new("tx".into(), 0);
        assert!(receipt.add_confirmation("key-1"));
        assert!(receipt.add_confirmation("key-2"));
        assert!(!receipt.add_confirmation("key-1"));
        assert_eq!(receipt.confirmations, vec!["key-1", "key-2"]);
    }
}

mod rate_limit_tests {
    use murmurnet::clock::{Clock, ManualClock};
    use murmurnet::ratelimit::{RateLimitStore, DAILY_MESSAGE_LIMIT};
    use murmurnet::store::MemorySecureStore;
    use std::sync::Arc;

    // 2024-03-10T08:00:00Z
    const MORNING: u64 = 1_710_057_600_000;

    #[test]
    fn test_limit_unlock_and_rollover() {
        let clock = Arc::new(ManualClock::new(MORNING));
        let store = RateLimitStore::new(
            Arc::new(MemorySecureStore::new()),
            clock.clone() as Arc<dyn Clock>,
        );

        for _ in 0..DAILY_MESSAGE_LIMIT {
            assert!(store.record_send("wallet-1").unwrap());
        }
        // Fourth send denied
        assert!(!store.record_send("wallet-1").unwrap());

        // A transaction submitted today lifts the cap
        store.unlock_today("wallet-1").unwrap();
        assert!(store.record_send("wallet-1").unwrap());
        assert!(store.record_send("wallet-1").unwrap());

        // Next UTC day starts from zero, locked again
        clock.advance(24 * 60 * 60 * 1000);
        let status = store.status("wallet-1").unwrap();
        assert_eq!(status.remaining, DAILY_MESSAGE_LIMIT);
        assert!(!status.unlocked);
    }
}

mod envelope_tests {
    use murmurnet::clock::ManualClock;
    use murmurnet::nonce::{CachedNonceValue, DurableNonceEnvelope, DurableNonceManager};
    use murmurnet::store::MemorySecureStore;
    use solana_sdk::hash::Hash;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::{Keypair, Signer};
    use std::sync::Arc;

    #[test]
    fn test_envelope_survives_relay_encoding() {
        let manager = DurableNonceManager::new(
            Arc::new(MemorySecureStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        let sender = Keypair::new();
        let cached = CachedNonceValue {
            nonce_account: Pubkey::new_unique().to_string(),
            authority: sender.pubkey().to_string(),
            nonce_value: Hash::new_unique().to_string(),
            fetched_at: 0,
            used: false,
        };

        let tx = manager
            .build_transfer_from_cache(
                sender.pubkey(),
                Pubkey::new_unique(),
                100_000_000,
                None,
                &cached,
            )
            .unwrap();
        let envelope = manager.sign_envelope(tx, &[&sender]).unwrap();

        // The relay moves envelopes as base64 text
        let over_the_wire = envelope.to_base64().unwrap();
        let received = DurableNonceEnvelope::from_base64(&over_the_wire).unwrap();
        received.verify().unwrap();
        received.transaction().unwrap().verify().unwrap();
        assert_eq!(received.nonce_value, cached.nonce_value);
    }
}
