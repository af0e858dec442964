//! Process-wide application stats: version, uptime, and the task-count
//! health input, following `freeq-server::web`'s `START_TIME: OnceLock`
//! pattern for the one value that genuinely is "first call wins".

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::SystemTime;

use crate::ordered_json::OrderedJson;
use crate::stats::{health_from_task_count, Health, StatsProvider};

static START_TIME: OnceLock<SystemTime> = OnceLock::new();

fn start_time() -> SystemTime {
    *START_TIME.get_or_init(SystemTime::now)
}

pub fn uptime_seconds() -> u64 {
    start_time().elapsed().unwrap_or_default().as_secs()
}

/// Tracks live task count as components spawn/complete background work.
/// Reported both in `/api/v1/stats` and folded into overall health.
pub struct TaskCounter(AtomicI64);

impl TaskCounter {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn health(&self) -> Health {
        health_from_task_count(self.get())
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ApplicationStats {
    pub task_counter: std::sync::Arc<TaskCounter>,
}

impl StatsProvider for ApplicationStats {
    fn name(&self) -> &str {
        "application"
    }

    fn snapshot(&self) -> OrderedJson {
        OrderedJson::object()
            .field("version", env!("CARGO_PKG_VERSION"))
            .field("uptime_seconds", uptime_seconds())
            .field("task_count", self.task_counter.get())
            .field("task_count_health", self.task_counter.health().as_str())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_counter_tracks_increments_and_decrements() {
        let counter = TaskCounter::new();
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn task_counter_health_follows_thresholds() {
        let counter = TaskCounter::new();
        assert_eq!(counter.health(), Health::Green);
    }
}
