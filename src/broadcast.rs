//! Peer ranker and broadcast store (component C): publish fan-out with
//! ranked peer selection, TTL dedup cache, and a bounded worker queue.
//!
//! The TTL cache borrows the shape of `s2s.rs`'s `DedupSet` (a
//! lock-guarded map checked before forwarding) but keys on wall-clock
//! expiry rather than a per-origin high-water mark, since here the
//! source is "was this event ID published recently", not "is this event
//! ID in sequence from a known origin".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::build_auth_event;
use crate::error::CoreError;
use crate::model::{ClientMessage, ErrorPrefix, Event, EventId, Filter, PrefixedError, RelayMessage};
use crate::ranker::Ranker;
use crate::registry::PeerRegistry;
use crate::stats::ConsecutiveFailureCounter;

pub const DEFAULT_MAX_PUBLISH_RELAYS: usize = 50;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(7);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const PUBLISH_DEADLINE: Duration = Duration::from_secs(7);
const RECOMMENDED_RELAYS_KIND: u32 = 10_002;
const BROADCAST_QUEUE_CAPACITY: usize = 1024;
/// How long to wait for the peer's NIP-42 `["AUTH", challenge]` frame
/// after an `auth-required` rejection, before giving up on the retry.
const AUTH_RETRY_WAIT: Duration = Duration::from_secs(2);

struct BroadcastJob {
    event: Event,
    targets: Vec<String>,
    respond: oneshot::Sender<Result<(), CoreError>>,
}

enum PeerOutcome {
    Accepted,
    Skipped,
    Failed(PrefixedError),
}

/// Exclusive-lock-on-write, shared-lock-on-read TTL cache of recently
/// published event IDs.
struct DedupCache {
    entries: RwLock<HashMap<EventId, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    fn new(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl }
    }

    fn contains(&self, id: &EventId) -> bool {
        match self.entries.read().get(id) {
            Some(inserted) => inserted.elapsed() < self.ttl,
            None => false,
        }
    }

    fn insert(&self, id: EventId) {
        self.entries.write().insert(id, Instant::now());
    }

    /// Lazy sweep: drops every entry older than `ttl`. Invoked on a timer
    /// by `BroadcastStore::spawn_sweeper`.
    fn sweep(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, inserted| inserted.elapsed() < self.ttl);
    }
}

pub struct BroadcastStore {
    registry: Arc<PeerRegistry>,
    ranker: Arc<Ranker>,
    cache: Arc<DedupCache>,
    mandatory: Vec<String>,
    max_publish_relays: usize,
    queue_tx: mpsc::Sender<BroadcastJob>,
    /// Resets on any peer accepting a given broadcast; increments when
    /// none do. This is the "publish" health input.
    pub publish_failure_counter: Arc<ConsecutiveFailureCounter>,
    /// Tracks enqueue/dequeue-level operational failures (queue
    /// closed, enqueue deadline exceeded) rather than per-peer
    /// rejections. This is the "broadcast" health input.
    pub broadcast_failure_counter: Arc<ConsecutiveFailureCounter>,
    seckey: Option<[u8; 32]>,
}

impl BroadcastStore {
    pub fn new(
        registry: Arc<PeerRegistry>,
        mandatory: Vec<String>,
        max_publish_relays: usize,
        worker_count: usize,
        cache_ttl: Duration,
        success_rate_decay: f64,
        seckey: Option<[u8; 32]>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
        let store = Arc::new(Self {
            registry,
            ranker: Arc::new(Ranker::with_decay(success_rate_decay)),
            cache: Arc::new(DedupCache::new(cache_ttl)),
            mandatory,
            max_publish_relays,
            queue_tx,
            publish_failure_counter: Arc::new(ConsecutiveFailureCounter::new()),
            broadcast_failure_counter: Arc::new(ConsecutiveFailureCounter::new()),
            seckey,
        });

        let receiver = Arc::new(AsyncMutex::new(queue_rx));
        for _ in 0..worker_count.max(1) {
            tokio::spawn(worker_loop(
                receiver.clone(),
                store.registry.clone(),
                store.ranker.clone(),
                store.cache.clone(),
                store.publish_failure_counter.clone(),
                store.seckey,
            ));
        }

        let sweep_cache = store.cache.clone();
        let sweep_ttl = cache_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_ttl).await;
                sweep_cache.sweep();
            }
        });

        store
    }

    pub fn ranker(&self) -> &Arc<Ranker> {
        &self.ranker
    }

    /// Selects `{mandatory} ∪ top-N candidates by descending success
    /// rate`, deduplicated, and enqueues a broadcast job. Blocks (up to
    /// `deadline`) if the worker queue is full.
    pub async fn publish(&self, event: Event, deadline: Duration) -> Result<(), CoreError> {
        let targets = self.select_targets();
        let (respond_tx, respond_rx) = oneshot::channel();
        let job = BroadcastJob { event, targets, respond: respond_tx };

        if let Err(e) = self.enqueue(job, deadline).await {
            self.broadcast_failure_counter.record_failure();
            return Err(e);
        }
        self.broadcast_failure_counter.record_success();

        tokio::time::timeout(deadline, respond_rx)
            .await
            .map_err(|_| CoreError::Internal("broadcast outcome wait exceeded deadline".to_string()))?
            .map_err(|_| CoreError::Internal("broadcast worker dropped without responding".to_string()))?
    }

    async fn enqueue(&self, job: BroadcastJob, deadline: Duration) -> Result<(), CoreError> {
        tokio::time::timeout(deadline, self.queue_tx.send(job))
            .await
            .map_err(|_| CoreError::Internal("broadcast queue enqueue exceeded deadline".to_string()))?
            .map_err(|_| CoreError::Internal("broadcast queue closed".to_string()))
    }

    /// Asks each seed peer for its user's recommended-relays event (kind
    /// 10002, NIP-65 relay list) and unions the `r`-tagged URLs into the
    /// ranker's candidate pool. Available both at startup and on demand.
    pub async fn discover_from_seeds(&self, seeds: &[String], deadline: Duration) {
        let mut discovered = HashSet::new();
        for seed in seeds {
            let Ok(session) = self.registry.acquire(seed, deadline).await else {
                continue;
            };

            let sub_id = discovery_sub_id();
            let filter = Filter { kinds: vec![RECOMMENDED_RELAYS_KIND], limit: Some(1), ..Default::default() };
            let req = ClientMessage::Req { sub_id: sub_id.clone(), filters: vec![filter] };
            if session.send_client_message(&req).await.is_err() {
                continue;
            }

            let deadline_at = Instant::now() + deadline;
            loop {
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match session.recv(remaining).await {
                    Some(RelayMessage::Event { event, .. }) => {
                        for tag in &event.tags {
                            if tag.name() == Some("r") {
                                if let Some(url) = tag.value() {
                                    discovered.insert(url.to_string());
                                }
                            }
                        }
                    }
                    Some(RelayMessage::Eose { .. }) | None => break,
                    _ => continue,
                }
            }
            let _ = session.send_client_message(&ClientMessage::Close { sub_id }).await;
        }

        info!(seeds = seeds.len(), discovered = discovered.len(), "broadcast peer discovery complete");
        for peer in discovered {
            self.ranker.observe(&peer);
        }
    }

    /// Spawns a background task repeating `discover_from_seeds` every
    /// `interval`. A no-op when `seeds` is empty.
    pub fn spawn_periodic_discovery(self: &Arc<Self>, seeds: Vec<String>, interval: Duration, initial_timeout: Duration) {
        if seeds.is_empty() {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.discover_from_seeds(&seeds, initial_timeout).await;
            }
        });
    }

    fn select_targets(&self) -> Vec<String> {
        let mut targets = self.mandatory.clone();
        for candidate in self.ranker.top_n(self.max_publish_relays) {
            if !targets.contains(&candidate) {
                targets.push(candidate);
            }
        }
        targets
    }
}

fn discovery_sub_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("discover-{}", hex::encode(bytes))
}

async fn worker_loop(
    receiver: Arc<AsyncMutex<mpsc::Receiver<BroadcastJob>>>,
    registry: Arc<PeerRegistry>,
    ranker: Arc<Ranker>,
    cache: Arc<DedupCache>,
    failure_counter: Arc<ConsecutiveFailureCounter>,
    seckey: Option<[u8; 32]>,
) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };
        execute_job(job, &registry, &ranker, &cache, &failure_counter, seckey).await;
    }
}

async fn execute_job(
    job: BroadcastJob,
    registry: &Arc<PeerRegistry>,
    ranker: &Arc<Ranker>,
    cache: &Arc<DedupCache>,
    failure_counter: &Arc<ConsecutiveFailureCounter>,
    seckey: Option<[u8; 32]>,
) {
    let outcomes = join_all(
        job.targets
            .iter()
            .map(|peer| publish_to_peer(peer.clone(), job.event.clone(), registry.clone(), ranker.clone(), cache.clone(), seckey)),
    )
    .await;

    let any_accepted = outcomes.iter().any(|o| matches!(o, PeerOutcome::Accepted | PeerOutcome::Skipped));
    if any_accepted {
        failure_counter.record_success();
        let _ = job.respond.send(Ok(()));
        return;
    }

    failure_counter.record_failure();
    let errors: Vec<PrefixedError> = outcomes
        .into_iter()
        .filter_map(|o| match o {
            PeerOutcome::Failed(e) => Some(e),
            _ => None,
        })
        .collect();

    let outcome = match CoreError::first_prefixed(&errors) {
        Some(first) => Err(CoreError::PeerSemantic(first.clone())),
        None if !errors.is_empty() => Err(CoreError::AllPeersFailed { errors }),
        None => Err(CoreError::AllPeersFailed { errors: Vec::new() }),
    };
    let _ = job.respond.send(outcome);
}

async fn publish_to_peer(
    peer: String,
    event: Event,
    registry: Arc<PeerRegistry>,
    ranker: Arc<Ranker>,
    cache: Arc<DedupCache>,
    seckey: Option<[u8; 32]>,
) -> PeerOutcome {
    if cache.contains(&event.id) {
        return PeerOutcome::Skipped;
    }

    let session = match registry.acquire(&peer, PUBLISH_DEADLINE).await {
        Ok(session) => session,
        Err(e) => {
            ranker.record_outcome(&peer, false);
            return PeerOutcome::Failed(PrefixedError { prefix: None, message: e.to_string(), peer });
        }
    };

    let publish = ClientMessage::Event { event: event.clone() };
    if let Err(e) = session.send_client_message(&publish).await {
        ranker.record_outcome(&peer, false);
        return PeerOutcome::Failed(PrefixedError { prefix: None, message: e.to_string(), peer });
    }

    let response = session.recv(PUBLISH_DEADLINE).await;
    match response {
        Some(crate::model::RelayMessage::Ok { accepted: true, .. }) => {
            ranker.record_outcome(&peer, true);
            cache.insert(event.id.clone());
            PeerOutcome::Accepted
        }
        Some(crate::model::RelayMessage::Ok { accepted: false, message, .. }) => {
            let prefix = ErrorPrefix::parse(&message);
            if prefix == Some(ErrorPrefix::AuthRequired) {
                if let Some(seckey) = seckey {
                    if retry_after_auth(&session, &event, &peer, &seckey).await {
                        ranker.record_outcome(&peer, true);
                        cache.insert(event.id.clone());
                        return PeerOutcome::Accepted;
                    }
                }
            }
            ranker.record_outcome(&peer, false);
            PeerOutcome::Failed(PrefixedError { prefix, message, peer })
        }
        _ => {
            ranker.record_outcome(&peer, false);
            PeerOutcome::Failed(PrefixedError {
                prefix: None,
                message: "no OK response before deadline".to_string(),
                peer,
            })
        }
    }
}

/// Signed AUTH retry, attempted exactly once per publish. Waits for the
/// peer's own NIP-42 challenge rather than inventing one; gives up if it
/// never arrives.
async fn retry_after_auth(session: &crate::registry::Session, event: &Event, peer: &str, seckey: &[u8; 32]) -> bool {
    let Some(challenge) = session.recv(AUTH_RETRY_WAIT).await.and_then(|m| match m {
        crate::model::RelayMessage::Auth { challenge } => Some(challenge),
        _ => None,
    }) else {
        return false;
    };

    let Ok(auth_event) = build_auth_event(seckey, peer, &challenge) else {
        return false;
    };
    if session
        .send_client_message(&ClientMessage::Event { event: auth_event })
        .await
        .is_err()
    {
        return false;
    }

    let retry = ClientMessage::Event { event: event.clone() };
    if session.send_client_message(&retry).await.is_err() {
        return false;
    }
    matches!(session.recv(PUBLISH_DEADLINE).await, Some(crate::model::RelayMessage::Ok { accepted: true, .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_within_ttl() {
        let cache = DedupCache::new(Duration::from_secs(60));
        let id = EventId::from("abc");
        assert!(!cache.contains(&id));
        cache.insert(id.clone());
        assert!(cache.contains(&id));
    }

    #[test]
    fn cache_miss_after_ttl_elapses() {
        let cache = DedupCache::new(Duration::from_millis(1));
        let id = EventId::from("abc");
        cache.insert(id.clone());
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.contains(&id));
    }

    #[test]
    fn sweep_drops_expired_entries_only() {
        let cache = DedupCache::new(Duration::from_millis(5));
        cache.insert(EventId::from("old"));
        std::thread::sleep(Duration::from_millis(10));
        cache.insert(EventId::from("new"));
        cache.sweep();
        assert!(!cache.contains(&EventId::from("old")));
    }

    #[tokio::test]
    async fn select_targets_includes_mandatory_and_dedups() {
        let registry = Arc::new(PeerRegistry::new(None));
        let store = BroadcastStore::new(registry, vec!["wss://mandatory".to_string()], 10, 1, Duration::from_secs(60), 0.9, None);
        store.ranker().observe("wss://mandatory");
        store.ranker().observe("wss://other");
        let targets = store.select_targets();
        assert!(targets.contains(&"wss://mandatory".to_string()));
        assert_eq!(targets.iter().filter(|t| *t == "wss://mandatory").count(), 1);
    }
}
