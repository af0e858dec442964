//! Mirror loop (component D): a standing `{since = now}` subscription
//! across query peers, fed into the local broadcast sink so subscribed
//! clients see upstream activity without polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::QueryAggregator;
use crate::broadcast::BroadcastStore;
use crate::model::Filter;
use crate::ordered_json::OrderedJson;
use crate::registry::PeerRegistry;
use crate::stats::{ConsecutiveFailureCounter, StatsProvider};

const HEALTH_TICK_INTERVAL: Duration = Duration::from_secs(30);
const SUBSCRIBE_DEADLINE: Duration = Duration::from_secs(7);

pub struct MirrorLoop {
    registry: Arc<PeerRegistry>,
    aggregator: Arc<QueryAggregator>,
    broadcast: Arc<BroadcastStore>,
    query_peers: Vec<String>,
    cancel: AsyncMutex<Option<CancellationToken>>,
    pub failure_counter: ConsecutiveFailureCounter,
    mirrored_events: AtomicU64,
    live_peers: AtomicU64,
    dead_peers: AtomicU64,
}

impl MirrorLoop {
    pub fn new(
        registry: Arc<PeerRegistry>,
        aggregator: Arc<QueryAggregator>,
        broadcast: Arc<BroadcastStore>,
        query_peers: Vec<String>,
    ) -> Self {
        Self {
            registry,
            aggregator,
            broadcast,
            query_peers,
            cancel: AsyncMutex::new(None),
            failure_counter: ConsecutiveFailureCounter::new(),
            mirrored_events: AtomicU64::new(0),
            live_peers: AtomicU64::new(0),
            dead_peers: AtomicU64::new(0),
        }
    }

    /// Idempotent; a no-op when no query peers are configured. Aborts the
    /// process (by returning an error the caller propagates) if every
    /// query peer fails its initial acquire.
    pub async fn start_mirroring(self: &Arc<Self>) -> Result<(), crate::error::CoreError> {
        if self.query_peers.is_empty() {
            return Ok(());
        }
        {
            let existing = self.cancel.lock().await;
            if existing.is_some() {
                return Ok(());
            }
        }

        let mut any_live = false;
        for peer in &self.query_peers {
            if self.registry.acquire(peer, SUBSCRIBE_DEADLINE).await.is_ok() {
                any_live = true;
            }
        }
        if !any_live {
            return Err(crate::error::CoreError::Internal(
                "every query peer failed its initial connection; mirror startup aborted".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let since_filter = Filter::since_now(chrono::Utc::now().timestamp());
        tokio::spawn(mirror_subscription_task(self.clone(), since_filter, cancel.clone()));
        tokio::spawn(health_monitor_task(self.clone(), cancel));

        info!(peers = self.query_peers.len(), "mirror loop started");
        Ok(())
    }

    pub async fn stop_mirroring(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
    }

    pub async fn close(&self) {
        self.stop_mirroring().await;
    }

    pub fn mirrored_events(&self) -> u64 {
        self.mirrored_events.load(Ordering::Relaxed)
    }

    pub fn live_dead_counts(&self) -> (u64, u64) {
        (self.live_peers.load(Ordering::Relaxed), self.dead_peers.load(Ordering::Relaxed))
    }
}

async fn mirror_subscription_task(mirror: Arc<MirrorLoop>, filter: Filter, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let query_result = mirror
            .aggregator
            .query(filter.clone(), Duration::from_secs(3600))
            .await;
        let Ok((mut events, _peer_cancel)) = query_result else {
            warn!("mirror subscription failed to establish, retrying");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                _ = cancel.cancelled() => return,
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            mirror.mirrored_events.fetch_add(1, Ordering::Relaxed);
                            let _ = mirror.broadcast.publish(event, Duration::from_secs(7)).await;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

async fn health_monitor_task(mirror: Arc<MirrorLoop>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(HEALTH_TICK_INTERVAL) => {}
        }

        let mut live = 0u64;
        let mut dead = 0u64;
        for peer in &mirror.query_peers {
            match mirror.registry.acquire(peer, SUBSCRIBE_DEADLINE).await {
                Ok(_) => live += 1,
                Err(_) => dead += 1,
            }
        }
        mirror.live_peers.store(live, Ordering::Relaxed);
        mirror.dead_peers.store(dead, Ordering::Relaxed);

        if dead as usize * 2 > mirror.query_peers.len() {
            mirror.failure_counter.record_failure();
        } else {
            mirror.failure_counter.record_success();
        }
    }
}

impl StatsProvider for MirrorLoop {
    fn name(&self) -> &str {
        "mirror"
    }

    fn snapshot(&self) -> OrderedJson {
        let (live, dead) = self.live_dead_counts();
        OrderedJson::object()
            .field("mirrored_events", self.mirrored_events())
            .field("live_peers", live)
            .field("dead_peers", dead)
            .field("consecutive_failures", self.failure_counter.get())
            .field("health", self.failure_counter.health().as_str())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_mirroring_is_noop_without_query_peers() {
        let registry = Arc::new(PeerRegistry::new(None));
        let aggregator = Arc::new(QueryAggregator::new(registry.clone(), vec![]));
        let broadcast = BroadcastStore::new(registry.clone(), vec![], 10, 1, Duration::from_secs(60), 0.9, None);
        let mirror = Arc::new(MirrorLoop::new(registry, aggregator, broadcast, vec![]));
        assert!(mirror.start_mirroring().await.is_ok());
        assert_eq!(mirror.live_dead_counts(), (0, 0));
    }

    #[tokio::test]
    async fn start_mirroring_aborts_when_every_peer_is_dead() {
        let registry = Arc::new(PeerRegistry::new(None));
        let peers = vec!["ws://127.0.0.1:1".to_string()];
        let aggregator = Arc::new(QueryAggregator::new(registry.clone(), peers.clone()));
        let broadcast = BroadcastStore::new(registry.clone(), vec![], 10, 1, Duration::from_secs(60), 0.9, None);
        let mirror = Arc::new(MirrorLoop::new(registry, aggregator, broadcast, peers));
        assert!(mirror.start_mirroring().await.is_err());
    }
}
