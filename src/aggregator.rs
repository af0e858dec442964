//! Query aggregator (component B): fan-out REQ/COUNT across query peers,
//! fan-in deduplicated events.
//!
//! Structurally this mirrors the federation-upstream reader-task pattern
//! (one background task per remote, forwarding into a shared channel) but
//! adds the merge-and-dedup stage the upstream manager doesn't need,
//! since there each convo has exactly one upstream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classifier::{classify, Intent, RequestContext};
use crate::error::CoreError;
use crate::model::{ClientMessage, Event, EventId, Filter, RelayMessage};
use crate::registry::PeerRegistry;
use crate::stats::ConsecutiveFailureCounter;

const MAX_CONCURRENT_FANOUTS: usize = 20;
const MERGE_CHANNEL_CAPACITY: usize = 1024;

enum RawMessage {
    Event(Event),
    PeerEos,
}

pub struct QueryAggregator {
    registry: Arc<PeerRegistry>,
    peers: Vec<String>,
    countable: RwLock<HashSet<String>>,
    fanout_semaphore: Arc<Semaphore>,
    pub failure_counter: ConsecutiveFailureCounter,
    internal_requests: AtomicU64,
}

impl QueryAggregator {
    pub fn new(registry: Arc<PeerRegistry>, peers: Vec<String>) -> Self {
        Self {
            registry,
            peers,
            countable: RwLock::new(HashSet::new()),
            fanout_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_FANOUTS)),
            failure_counter: ConsecutiveFailureCounter::new(),
            internal_requests: AtomicU64::new(0),
        }
    }

    pub fn internal_requests(&self) -> u64 {
        self.internal_requests.load(Ordering::Relaxed)
    }

    /// Applies the request-intent classifier ahead of `query`: internal or
    /// deletion-check-shape filters close immediately without touching any
    /// peer.
    pub async fn query_checked(
        &self,
        filter: Filter,
        ctx: &RequestContext,
        deadline: Duration,
    ) -> Result<(mpsc::Receiver<Event>, CancellationToken), CoreError> {
        if classify(&filter, ctx) == Intent::ShortCircuit {
            self.internal_requests.fetch_add(1, Ordering::Relaxed);
            let (_tx, rx) = mpsc::channel(1);
            return Ok((rx, CancellationToken::new()));
        }
        self.query(filter, deadline).await
    }

    /// Applies the request-intent classifier ahead of `count`.
    pub async fn count_checked(&self, filter: Filter, ctx: &RequestContext, deadline: Duration) -> Result<u64, CoreError> {
        if classify(&filter, ctx) == Intent::ShortCircuit {
            self.internal_requests.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }
        self.count(filter, deadline).await
    }

    /// Called once by the capability probe (component G) after startup
    /// discovery; replaces the countable subset wholesale.
    pub fn set_countable_peers(&self, countable: HashSet<String>) {
        *self.countable.write() = countable;
    }

    pub fn semaphore_available(&self) -> usize {
        self.fanout_semaphore.available_permits()
    }

    pub fn semaphore_capacity(&self) -> usize {
        MAX_CONCURRENT_FANOUTS
    }

    /// `Query(filter, intent-flags) -> (event-stream, cancel)`.
    pub async fn query(
        &self,
        filter: Filter,
        deadline: Duration,
    ) -> Result<(mpsc::Receiver<Event>, CancellationToken), CoreError> {
        let permit = tokio::time::timeout(deadline, self.fanout_semaphore.clone().acquire_owned())
            .await
            .map_err(|_| CoreError::Internal("fan-out semaphore wait exceeded deadline".to_string()))?
            .map_err(|_| CoreError::Internal("fan-out semaphore closed".to_string()))?;

        let live_peers = self.live_precheck(deadline).await;

        let cancel = CancellationToken::new();
        let (raw_tx, raw_rx) = mpsc::channel(MERGE_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(MERGE_CHANNEL_CAPACITY);

        let sub_id = subscription_id();
        let deadline_at = Instant::now() + deadline;

        for peer in &live_peers {
            tokio::spawn(peer_reader_task(
                self.registry.clone(),
                peer.clone(),
                sub_id.clone(),
                vec![filter.clone()],
                raw_tx.clone(),
                cancel.clone(),
                deadline,
            ));
        }
        drop(raw_tx);

        tokio::spawn(merge_task(raw_rx, out_tx, cancel.clone(), deadline_at, live_peers.len(), permit));

        Ok((out_rx, cancel))
    }

    /// `Count(filter) -> integer`. Dispatched only to capability-probed
    /// peers; sums per-peer counts without cross-peer dedup.
    pub async fn count(&self, filter: Filter, deadline: Duration) -> Result<u64, CoreError> {
        let countable: Vec<String> = self.countable.read().iter().cloned().collect();
        if countable.is_empty() {
            return Err(CoreError::CapabilityAbsent);
        }

        let sub_id = subscription_id();
        let mut total = 0u64;
        for peer in countable {
            let Ok(session) = self.registry.acquire(&peer, deadline).await else {
                continue;
            };
            let msg = ClientMessage::Count { sub_id: sub_id.clone(), filters: vec![filter.clone()] };
            if session.send_client_message(&msg).await.is_err() {
                continue;
            }
            if let Some(RelayMessage::Count { count, .. }) = session.recv(deadline).await {
                total += count;
            }
        }
        Ok(total)
    }

    async fn live_precheck(&self, deadline: Duration) -> Vec<String> {
        let mut live = Vec::new();
        let mut any_failed = false;
        for peer in &self.peers {
            match self.registry.acquire(peer, deadline).await {
                Ok(_) => live.push(peer.clone()),
                Err(_) => any_failed = true,
            }
        }
        if any_failed {
            self.failure_counter.record_failure();
        } else {
            self.failure_counter.record_success();
        }
        live
    }
}

fn subscription_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn peer_reader_task(
    registry: Arc<PeerRegistry>,
    peer: String,
    sub_id: String,
    filters: Vec<Filter>,
    raw_tx: mpsc::Sender<RawMessage>,
    cancel: CancellationToken,
    deadline: Duration,
) {
    let Ok(session) = registry.acquire(&peer, deadline).await else {
        let _ = raw_tx.send(RawMessage::PeerEos).await;
        return;
    };

    let req = ClientMessage::Req { sub_id: sub_id.clone(), filters };
    if session.send_client_message(&req).await.is_err() {
        let _ = raw_tx.send(RawMessage::PeerEos).await;
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = session.recv(deadline) => {
                match msg {
                    Some(RelayMessage::Event { sub_id: sid, event }) if sid == sub_id => {
                        if raw_tx.send(RawMessage::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Some(RelayMessage::Eose { sub_id: sid }) if sid == sub_id => break,
                    Some(_) => continue,
                    None => break,
                }
            }
        }
    }

    let close = ClientMessage::Close { sub_id };
    let _ = session.send_client_message(&close).await;
    let _ = raw_tx.send(RawMessage::PeerEos).await;
}

async fn merge_task(
    mut raw_rx: mpsc::Receiver<RawMessage>,
    out_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    deadline_at: Instant,
    peer_count: usize,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let mut seen: HashSet<EventId> = HashSet::new();
    let mut eos_count = 0usize;
    if peer_count == 0 {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline_at) => break,
            msg = raw_rx.recv() => match msg {
                Some(RawMessage::Event(event)) => {
                    if seen.insert(event.id.clone()) {
                        if out_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Some(RawMessage::PeerEos) => {
                    eos_count += 1;
                    if eos_count >= peer_count {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!(peers = peer_count, deduped = seen.len(), "query fan-in closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_aggregator_starts_with_full_semaphore() {
        let registry = Arc::new(PeerRegistry::new(None));
        let agg = QueryAggregator::new(registry, vec!["wss://a.example".to_string()]);
        assert_eq!(agg.semaphore_available(), 20);
        assert_eq!(agg.semaphore_capacity(), 20);
    }

    #[tokio::test]
    async fn count_without_countable_peers_is_capability_absent() {
        let registry = Arc::new(PeerRegistry::new(None));
        let agg = QueryAggregator::new(registry, vec![]);
        let err = agg.count(Filter::default(), Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, CoreError::CapabilityAbsent));
    }

    #[tokio::test]
    async fn query_with_zero_peers_closes_immediately() {
        let registry = Arc::new(PeerRegistry::new(None));
        let agg = QueryAggregator::new(registry, vec![]);
        let (mut rx, _cancel) = agg.query(Filter::default(), Duration::from_millis(100)).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn deletion_check_shape_short_circuits_without_contacting_peers() {
        use crate::classifier::RequestContext;
        use std::collections::BTreeMap;

        let registry = Arc::new(PeerRegistry::new(None));
        let agg = QueryAggregator::new(registry, vec!["ws://127.0.0.1:1".to_string()]);
        let mut tags = BTreeMap::new();
        tags.insert("#e".to_string(), vec!["deadbeef".to_string()]);
        let filter = Filter { kinds: vec![5], tags, ..Default::default() };
        let ctx = RequestContext { internal_marker: false, sub_id: None };

        let count = agg.count_checked(filter.clone(), &ctx, Duration::from_millis(50)).await.unwrap();
        assert_eq!(count, 0);
        let (mut rx, _cancel) = agg.query_checked(filter, &ctx, Duration::from_millis(50)).await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(agg.internal_requests(), 2);
    }
}
