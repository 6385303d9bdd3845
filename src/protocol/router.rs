//! TTL-bounded flood router
//!
//! Gates every inbound packet through a rate window, TTL check and bloom
//! dedup before deciding to deliver, forward or drop.

use super::bloom::BloomSet;
use super::packet::Packet;
use super::PeerId;
use std::collections::VecDeque;

/// Inbound messages tolerated per trailing window
pub const RATE_LIMIT_MAX: usize = 50;

/// Trailing rate-limit window
pub const RATE_LIMIT_WINDOW_MS: u64 = 1_000;

/// Bloom reset interval
pub const BLOOM_RESET_INTERVAL_MS: u64 = 3_600_000;

/// Expected distinct packets per bloom lifetime
pub const BLOOM_EXPECTED_ITEMS: usize = 10_000;

/// Target bloom false-positive rate
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Why a packet was not processed further
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TtlExpired,
    Duplicate,
    RateLimited,
}

/// Outcome of routing one inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    Drop(DropReason),
    DeliverLocal,
    Forward(Packet),
    DeliverAndForward(Packet),
}

/// Router counters
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub processed: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped_ttl: u64,
    pub dropped_duplicate: u64,
    pub dropped_rate_limited: u64,
}

type SessionProbe = Box<dyn Fn(&PeerId) -> bool + Send + Sync>;

/// Flood router with bloom dedup and a trailing rate window
pub struct Router {
    own_id: PeerId,
    bloom: BloomSet,
    rate_window: VecDeque<u64>,
    last_bloom_reset_ms: u64,
    stats: RouterStats,
    session_probe: Option<SessionProbe>,
}

impl Router {
    pub fn new(own_id: PeerId, now_ms: u64) -> Self {
        Self {
            own_id,
            bloom: BloomSet::new(BLOOM_EXPECTED_ITEMS, BLOOM_FALSE_POSITIVE_RATE),
            rate_window: VecDeque::new(),
            last_bloom_reset_ms: now_ms,
            stats: RouterStats::default(),
            session_probe: None,
        }
    }

    /// Install the read-only session capability
    ///
    /// Keeps the SessionManager out of the router's type graph; routing
    /// never mutates session state.
    pub fn set_session_probe(&mut self, probe: SessionProbe) {
        self.session_probe = Some(probe);
    }

    pub fn is_session_established(&self, peer: &PeerId) -> bool {
        self.session_probe
            .as_ref()
            .map(|probe| probe(peer))
            .unwrap_or(false)
    }

    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// TTL for a mesh of `peer_count` estimated peers
    ///
    /// ceil(log2(max(n, 2))) + 2, capped at the protocol maximum.
    pub fn optimal_ttl(peer_count: usize) -> u8 {
        let n = peer_count.max(2) as f64;
        let ttl = n.log2().ceil() as u8 + 2;
        ttl.min(super::MAX_TTL)
    }

    /// Decide what to do with one inbound packet
    pub fn route(&mut self, packet: &Packet, now_ms: u64) -> RoutingDecision {
        self.stats.processed += 1;

        self.prune_rate_window(now_ms);
        if self.rate_window.len() >= RATE_LIMIT_MAX {
            self.stats.dropped_rate_limited += 1;
            tracing::debug!("rate limit hit, dropping packet from {}", packet.sender);
            return RoutingDecision::Drop(DropReason::RateLimited);
        }
        self.rate_window.push_back(now_ms);

        if packet.ttl == 0 {
            self.stats.dropped_ttl += 1;
            return RoutingDecision::Drop(DropReason::TtlExpired);
        }

        let fingerprint = packet.dedup_fingerprint();
        if self.bloom.contains(fingerprint.as_bytes()) {
            self.stats.dropped_duplicate += 1;
            tracing::debug!("duplicate packet from {}, dropping", packet.sender);
            return RoutingDecision::Drop(DropReason::Duplicate);
        }
        self.bloom.add(fingerprint.as_bytes());

        match packet.recipient {
            Some(recipient) if recipient == self.own_id => {
                self.stats.delivered += 1;
                RoutingDecision::DeliverLocal
            }
            Some(recipient) if !recipient.is_broadcast() => {
                // Opaque relay toward someone else
                if packet.ttl <= 1 {
                    self.stats.dropped_ttl += 1;
                    return RoutingDecision::Drop(DropReason::TtlExpired);
                }
                self.stats.forwarded += 1;
                let mut forwarded = packet.clone();
                forwarded.ttl -= 1;
                RoutingDecision::Forward(forwarded)
            }
            _ => {
                self.stats.delivered += 1;
                if packet.ttl <= 1 {
                    return RoutingDecision::DeliverLocal;
                }
                self.stats.forwarded += 1;
                let mut forwarded = packet.clone();
                forwarded.ttl -= 1;
                RoutingDecision::DeliverAndForward(forwarded)
            }
        }
    }

    /// Record an own outbound broadcast so echoes are dropped as duplicates
    pub fn note_own_packet(&mut self, packet: &Packet) {
        self.bloom.add(packet.dedup_fingerprint().as_bytes());
    }

    /// Periodic upkeep: prune the rate window, reset the bloom hourly
    pub fn maintain(&mut self, now_ms: u64) {
        self.prune_rate_window(now_ms);

        if now_ms.saturating_sub(self.last_bloom_reset_ms) >= BLOOM_RESET_INTERVAL_MS {
            tracing::info!(
                "resetting dedup bloom (fill rate {:.4}, {} items)",
                self.bloom.fill_rate(),
                self.bloom.items_added()
            );
            self.bloom.clear();
            self.last_bloom_reset_ms = now_ms;
        }
    }

    fn prune_rate_window(&mut self, now_ms: u64) {
        while let Some(&oldest) = self.rate_window.front() {
            if now_ms.saturating_sub(oldest) >= RATE_LIMIT_WINDOW_MS {
                self.rate_window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn own_id() -> PeerId {
        PeerId::new([0xAA; 8])
    }

    fn packet(sender: u8, ttl: u8, timestamp: u64) -> Packet {
        Packet::new(
            MessageKind::ChatMessage,
            PeerId::new([sender; 8]),
            vec![sender, 1, 2, 3],
            timestamp,
        )
        .with_ttl(ttl)
    }

    #[test]
    fn test_broadcast_delivers_and_forwards() {
        let mut router = Router::new(own_id(), 0);
        match router.route(&packet(1, 3, 100), 0) {
            RoutingDecision::DeliverAndForward(forwarded) => {
                assert_eq!(forwarded.ttl, 2);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut router = Router::new(own_id(), 0);
        let p = packet(1, 3, 100);
        assert!(matches!(
            router.route(&p, 0),
            RoutingDecision::DeliverAndForward(_)
        ));
        assert_eq!(
            router.route(&p, 10),
            RoutingDecision::Drop(DropReason::Duplicate)
        );
        assert_eq!(router.stats().dropped_duplicate, 1);
    }

    #[test]
    fn test_ttl_zero_dropped() {
        let mut router = Router::new(own_id(), 0);
        assert_eq!(
            router.route(&packet(1, 0, 100), 0),
            RoutingDecision::Drop(DropReason::TtlExpired)
        );
    }

    #[test]
    fn test_ttl_one_broadcast_delivers_without_forward() {
        let mut router = Router::new(own_id(), 0);
        assert_eq!(
            router.route(&packet(1, 1, 100), 0),
            RoutingDecision::DeliverLocal
        );
    }

    #[test]
    fn test_directed_to_self_delivers() {
        let mut router = Router::new(own_id(), 0);
        let p = packet(1, 5, 100).with_recipient(own_id());
        assert_eq!(router.route(&p, 0), RoutingDecision::DeliverLocal);
    }

    #[test]
    fn test_directed_elsewhere_forwards_opaquely() {
        let mut router = Router::new(own_id(), 0);
        let p = packet(1, 5, 100).with_recipient(PeerId::new([0xBB; 8]));
        match router.route(&p, 0) {
            RoutingDecision::Forward(forwarded) => {
                assert_eq!(forwarded.ttl, 4);
                assert_eq!(forwarded.payload, p.payload);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_window() {
        let mut router = Router::new(own_id(), 0);
        for i in 0..RATE_LIMIT_MAX {
            let decision = router.route(&packet(1, 3, i as u64), 500);
            assert!(!matches!(
                decision,
                RoutingDecision::Drop(DropReason::RateLimited)
            ));
        }
        assert_eq!(
            router.route(&packet(1, 3, 9_999), 500),
            RoutingDecision::Drop(DropReason::RateLimited)
        );

        // Window slides; traffic resumes a second later
        assert!(!matches!(
            router.route(&packet(1, 3, 10_000), 1_600),
            RoutingDecision::Drop(DropReason::RateLimited)
        ));
    }

    #[test]
    fn test_own_broadcast_echo_dropped() {
        let mut router = Router::new(own_id(), 0);
        let p = packet(7, 5, 42);
        router.note_own_packet(&p);
        assert_eq!(
            router.route(&p, 0),
            RoutingDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_bloom_reset_on_maintenance() {
        let mut router = Router::new(own_id(), 0);
        let p = packet(1, 3, 100);
        assert!(matches!(
            router.route(&p, 0),
            RoutingDecision::DeliverAndForward(_)
        ));

        router.maintain(BLOOM_RESET_INTERVAL_MS);
        // Same fingerprint accepted again after the scheduled reset
        assert!(matches!(
            router.route(&p, BLOOM_RESET_INTERVAL_MS + 1),
            RoutingDecision::DeliverAndForward(_)
        ));
    }

    #[test]
    fn test_optimal_ttl() {
        assert_eq!(Router::optimal_ttl(0), 3);
        assert_eq!(Router::optimal_ttl(2), 3);
        assert_eq!(Router::optimal_ttl(8), 5);
        assert_eq!(Router::optimal_ttl(100), 9);
        assert_eq!(Router::optimal_ttl(100_000), 10);
    }

    #[test]
    fn test_session_probe() {
        let mut router = Router::new(own_id(), 0);
        let peer = PeerId::new([0xBB; 8]);
        assert!(!router.is_session_established(&peer));

        let target = peer;
        router.set_session_probe(Box::new(move |candidate| *candidate == target));
        assert!(router.is_session_established(&peer));
        assert!(!router.is_session_established(&PeerId::new([0xCC; 8])));
    }
}
