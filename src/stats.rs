//! Health & stats collector (component E).
//!
//! A process-wide singleton registry of `StatsProvider` handles, following
//! the same "lazily-initialized static" idiom as `freeq-server::web`'s
//! `START_TIME: OnceLock<SystemTime>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::ordered_json::OrderedJson;

/// Three-tier health state derived from a consecutive-failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Green,
    Yellow,
    Red,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Green => "GREEN",
            Health::Yellow => "YELLOW",
            Health::Red => "RED",
        }
    }

    /// HTTP status mapping for external probes.
    pub fn http_status(self) -> u16 {
        match self {
            Health::Green | Health::Yellow => 200,
            Health::Red => 503,
        }
    }

    /// Worst of two states — used to derive the overall "main" state.
    pub fn worst(self, other: Health) -> Health {
        use Health::*;
        match (self, other) {
            (Red, _) | (_, Red) => Red,
            (Yellow, _) | (_, Yellow) => Yellow,
            _ => Green,
        }
    }
}

/// Monotonically incremented on failure, atomically reset to 0 on success.
/// One per subsystem: publish, query, mirror, broadcast.
#[derive(Debug, Default)]
pub struct ConsecutiveFailureCounter(AtomicU64);

impl ConsecutiveFailureCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn record_failure(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// 0-2 -> GREEN, 3-9 -> YELLOW, >=10 -> RED.
    pub fn health(&self) -> Health {
        health_from_count(self.get())
    }
}

pub fn health_from_count(count: u64) -> Health {
    match count {
        0..=2 => Health::Green,
        3..=9 => Health::Yellow,
        _ => Health::Red,
    }
}

/// Task-count health contribution: >=30,000 -> YELLOW, >=100,000 -> RED.
pub fn health_from_task_count(tasks: u64) -> Health {
    if tasks >= 100_000 {
        Health::Red
    } else if tasks >= 30_000 {
        Health::Yellow
    } else {
        Health::Green
    }
}

/// A named source of an ordered JSON snapshot.
pub trait StatsProvider: Send + Sync {
    fn name(&self) -> &str;
    fn snapshot(&self) -> OrderedJson;
}

/// The process-wide registry. Registration (exclusive lock) only happens
/// at startup; reads (shared lock) happen per `/api/v1/stats` request.
pub struct StatsRegistry {
    providers: RwLock<Vec<Box<dyn StatsProvider>>>,
}

impl StatsRegistry {
    fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, provider: Box<dyn StatsProvider>) {
        self.providers.write().push(provider);
    }

    /// Ordered map of name -> snapshot, in registration order.
    pub fn all_stats(&self) -> OrderedJson {
        let providers = self.providers.read();
        let entries = providers
            .iter()
            .map(|p| (p.name().to_string(), p.snapshot()))
            .collect();
        OrderedJson::Object(entries)
    }
}

static REGISTRY: OnceLock<StatsRegistry> = OnceLock::new();

/// Access the process-wide stats registry, initializing it on first call.
/// Guards against the double-init race inherent to concurrent startup
/// paths by relying on `OnceLock`'s own synchronization rather than a
/// hand-rolled check-then-set.
pub fn registry() -> &'static StatsRegistry {
    REGISTRY.get_or_init(StatsRegistry::new)
}
