//! Peer ranker: exponential-decay success rate driving broadcast
//! selection (part of component C).

use std::collections::HashMap;

use parking_lot::RwLock;

const DEFAULT_SUCCESS_RATE: f64 = 0.5;
const DEFAULT_SUCCESS_RATE_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
struct PeerStats {
    success_rate: f64,
    first_seen_order: u64,
}

/// Tracks a success rate per peer URL and answers "top N by rate" queries
/// for broadcast target selection.
pub struct Ranker {
    decay: f64,
    peers: RwLock<HashMap<String, PeerStats>>,
    next_order: RwLock<u64>,
}

impl Ranker {
    pub fn new() -> Self {
        Self::with_decay(DEFAULT_SUCCESS_RATE_DECAY)
    }

    pub fn with_decay(decay: f64) -> Self {
        Self {
            decay,
            peers: RwLock::new(HashMap::new()),
            next_order: RwLock::new(0),
        }
    }

    /// Ensures `peer` is tracked, seeding it at the neutral success rate
    /// if unseen. Call this from discovery so a peer's earliest-known
    /// order (the tie-break) reflects discovery order, not first publish.
    pub fn observe(&self, peer: &str) {
        let mut peers = self.peers.write();
        if !peers.contains_key(peer) {
            let mut order = self.next_order.write();
            peers.insert(
                peer.to_string(),
                PeerStats { success_rate: DEFAULT_SUCCESS_RATE, first_seen_order: *order },
            );
            *order += 1;
        }
    }

    /// `S <- decay*S + (1-decay)*outcome`.
    pub fn record_outcome(&self, peer: &str, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        let mut peers = self.peers.write();
        let order_seed = {
            let mut order = self.next_order.write();
            let seed = *order;
            *order += 1;
            seed
        };
        let entry = peers.entry(peer.to_string()).or_insert(PeerStats {
            success_rate: DEFAULT_SUCCESS_RATE,
            first_seen_order: order_seed,
        });
        entry.success_rate = self.decay * entry.success_rate + (1.0 - self.decay) * outcome;
    }

    pub fn success_rate(&self, peer: &str) -> Option<f64> {
        self.peers.read().get(peer).map(|p| p.success_rate)
    }

    /// Top-`n` known peers by descending success rate, ties broken by
    /// earliest-known order. Peers never selected never update S, so this
    /// never mutates state.
    pub fn top_n(&self, n: usize) -> Vec<String> {
        let peers = self.peers.read();
        let mut entries: Vec<(&String, &PeerStats)> = peers.iter().collect();
        entries.sort_by(|a, b| {
            b.1.success_rate
                .partial_cmp(&a.1.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.first_seen_order.cmp(&b.1.first_seen_order))
        });
        entries.into_iter().take(n).map(|(url, _)| url.clone()).collect()
    }
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_peer_gets_neutral_rate() {
        let ranker = Ranker::new();
        ranker.observe("wss://a");
        assert_eq!(ranker.success_rate("wss://a"), Some(0.5));
    }

    #[test]
    fn decay_moves_rate_toward_outcome() {
        let ranker = Ranker::with_decay(0.9);
        ranker.observe("wss://a");
        ranker.record_outcome("wss://a", true);
        let rate = ranker.success_rate("wss://a").unwrap();
        assert!((rate - (0.9 * 0.5 + 0.1 * 1.0)).abs() < 1e-9);
    }

    #[test]
    fn repeated_failure_drives_rate_toward_zero() {
        let ranker = Ranker::with_decay(0.9);
        ranker.observe("wss://a");
        for _ in 0..200 {
            ranker.record_outcome("wss://a", false);
        }
        assert!(ranker.success_rate("wss://a").unwrap() < 0.01);
    }

    #[test]
    fn top_n_orders_by_rate_then_discovery() {
        let ranker = Ranker::new();
        ranker.observe("wss://a");
        ranker.observe("wss://b");
        ranker.observe("wss://c");
        ranker.record_outcome("wss://b", true);
        ranker.record_outcome("wss://b", true);
        ranker.record_outcome("wss://c", false);
        let top = ranker.top_n(2);
        assert_eq!(top, vec!["wss://b".to_string(), "wss://a".to_string()]);
    }

    #[test]
    fn top_n_never_mutates_unselected_peers() {
        let ranker = Ranker::new();
        ranker.observe("wss://a");
        ranker.observe("wss://b");
        let before = ranker.success_rate("wss://b");
        let _ = ranker.top_n(1);
        assert_eq!(ranker.success_rate("wss://b"), before);
    }
}
