//! Wires every component together and drives the startup sequence:
//! registry -> capability probe -> aggregator/broadcast/mirror -> HTTP
//! server. Mirrors `freeq_server::server::Server` as the place that owns
//! `SharedState` and exposes `run()`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::aggregator::QueryAggregator;
use crate::app_stats::{ApplicationStats, TaskCounter};
use crate::broadcast::{BroadcastStore, DEFAULT_CACHE_TTL};
use crate::capability::probe_countable_peers;
use crate::config::RelayConfig;
use crate::mirror::MirrorLoop;
use crate::ordered_json::OrderedJson;
use crate::policy::PolicyLayer;
use crate::registry::PeerRegistry;
use crate::stats::{registry as stats_registry, Health, StatsProvider};

/// Shared state handed to every axum handler.
pub struct SharedState {
    pub config: RelayConfig,
    pub registry: Arc<PeerRegistry>,
    pub aggregator: Arc<QueryAggregator>,
    pub broadcast: Arc<BroadcastStore>,
    pub mirror: Arc<MirrorLoop>,
    pub policy: Arc<PolicyLayer>,
    pub task_counter: Arc<TaskCounter>,
}

impl SharedState {
    /// Builds every component, probes capabilities, and registers stats
    /// providers. Aborts (returns `Err`) if `QUERY_REMOTES` is empty —
    /// the same hard-stop `freeq_server::server::Server::new` applies to
    /// an unusable listen configuration.
    pub async fn bootstrap(mut config: RelayConfig) -> Result<Arc<Self>> {
        config.validate().context("invalid configuration")?;

        let seckey = config.decode_seckey().context("failed to decode RELAY_SECKEY")?;
        if config.relay_pubkey.is_none() {
            if let Some(sk) = seckey {
                config.relay_pubkey = Some(crate::auth::derive_pubkey(&sk).context("failed to derive RELAY_PUBKEY")?);
            }
        }
        let registry = Arc::new(PeerRegistry::new(seckey));
        let aggregator = Arc::new(QueryAggregator::new(registry.clone(), config.query_remotes.clone()));

        let cache_ttl = if config.broadcast_cache_ttl.is_zero() {
            DEFAULT_CACHE_TTL
        } else {
            config.broadcast_cache_ttl
        };
        let broadcast = BroadcastStore::new(
            registry.clone(),
            config.broadcast_mandatory_relays.clone(),
            config.max_publish_relays,
            config.broadcast_worker_count(),
            cache_ttl,
            config.success_rate_decay,
            seckey,
        );

        let mirror = Arc::new(MirrorLoop::new(
            registry.clone(),
            aggregator.clone(),
            broadcast.clone(),
            config.query_remotes.clone(),
        ));

        if config.broadcast_enabled() {
            broadcast
                .discover_from_seeds(&config.broadcast_seed_relays, crate::broadcast::DEFAULT_INITIAL_TIMEOUT)
                .await;
            broadcast.spawn_periodic_discovery(
                config.broadcast_seed_relays.clone(),
                config.broadcast_refresh_interval,
                crate::broadcast::DEFAULT_INITIAL_TIMEOUT,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build capability-probe HTTP client")?;
        let countable = probe_countable_peers(&http_client, &config.query_remotes).await;
        info!(countable = countable.len(), total = config.query_remotes.len(), "capability probe complete");
        aggregator.set_countable_peers(countable);

        let task_counter = Arc::new(TaskCounter::new());

        let stats = stats_registry();
        stats.register(Box::new(ApplicationStats { task_counter: task_counter.clone() }));
        stats.register(Box::new(QueryStatsProvider { aggregator: aggregator.clone() }));
        stats.register(Box::new(BroadcastStatsProvider { broadcast: broadcast.clone() }));
        stats.register(Box::new(MirrorStatsProvider { mirror: mirror.clone() }));

        let state = Arc::new(Self {
            config,
            registry,
            aggregator,
            broadcast,
            mirror,
            policy: Arc::new(PolicyLayer::new()),
            task_counter,
        });

        if let Err(e) = state.mirror.start_mirroring().await {
            bail!("mirror startup aborted: {e}");
        }

        Ok(state)
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        crate::web::serve(self).await
    }

    /// Worst-of-four consecutive-failure health plus the task-count
    /// input, as component E specifies.
    pub fn overall_health(&self) -> Health {
        let publish = self.broadcast.publish_failure_counter.health();
        let query = self.aggregator.failure_counter.health();
        let mirror = self.mirror.failure_counter.health();
        let broadcast = self.broadcast.broadcast_failure_counter.health();
        publish.worst(query).worst(mirror).worst(broadcast).worst(self.task_counter.health())
    }
}

struct QueryStatsProvider {
    aggregator: Arc<QueryAggregator>,
}

impl StatsProvider for QueryStatsProvider {
    fn name(&self) -> &str {
        "query"
    }

    fn snapshot(&self) -> OrderedJson {
        OrderedJson::object()
            .field("semaphore_available", self.aggregator.semaphore_available())
            .field("semaphore_capacity", self.aggregator.semaphore_capacity())
            .field("internal_requests", self.aggregator.internal_requests())
            .field("consecutive_failures", self.aggregator.failure_counter.get())
            .field("health", self.aggregator.failure_counter.health().as_str())
            .build()
    }
}

struct BroadcastStatsProvider {
    broadcast: Arc<BroadcastStore>,
}

impl StatsProvider for BroadcastStatsProvider {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn snapshot(&self) -> OrderedJson {
        OrderedJson::object()
            .field("consecutive_publish_failures", self.broadcast.publish_failure_counter.get())
            .field("publish_health", self.broadcast.publish_failure_counter.health().as_str())
            .field("consecutive_broadcast_failures", self.broadcast.broadcast_failure_counter.get())
            .field("broadcast_health", self.broadcast.broadcast_failure_counter.health().as_str())
            .build()
    }
}

struct MirrorStatsProvider {
    mirror: Arc<MirrorLoop>,
}

impl StatsProvider for MirrorStatsProvider {
    fn name(&self) -> &str {
        StatsProvider::name(self.mirror.as_ref())
    }

    fn snapshot(&self) -> OrderedJson {
        self.mirror.snapshot()
    }
}
