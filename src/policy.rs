//! Policy layer (component H): per-IP rate limiting and event-validity
//! caps enforced before publish fan-out.

use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

use crate::model::Event;

const CONNECTION_BURST: NonZeroU32 = nonzero!(100u32);
const CONNECTION_WINDOW_SECS: u64 = 5 * 60;

const FILTER_RATE_PER_MINUTE: NonZeroU32 = nonzero!(20u32);
const FILTER_BURST: NonZeroU32 = nonzero!(100u32);

const MAX_CONTENT_BYTES: usize = 32_768;
const MAX_TAG_COUNT: usize = 100;
const FUTURE_SLACK_SECS: i64 = 3_600;
const PAST_SLACK_SECS: i64 = 31_536_000;
const MAX_KIND: u32 = 30_000;
const EMPTY_CONTENT_TAG_THRESHOLD: usize = 20;

type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Two independent per-source-IP rate limiters.
pub struct PolicyLayer {
    connection_limiter: IpLimiter,
    filter_limiter: IpLimiter,
}

impl PolicyLayer {
    pub fn new() -> Self {
        // One new connection per 5-minute window, burst 100.
        let connection_quota = Quota::with_period(std::time::Duration::from_secs(CONNECTION_WINDOW_SECS))
            .expect("nonzero window")
            .allow_burst(CONNECTION_BURST);

        // 20 filters per 1-minute window, burst 100.
        let filter_quota = Quota::per_minute(FILTER_RATE_PER_MINUTE).allow_burst(FILTER_BURST);

        Self {
            connection_limiter: RateLimiter::keyed(connection_quota),
            filter_limiter: RateLimiter::keyed(filter_quota),
        }
    }

    pub fn check_connection(&self, ip: IpAddr) -> Result<(), String> {
        self.connection_limiter
            .check_key(&ip)
            .map_err(|_| "rate limited: too many new connections".to_string())
    }

    pub fn check_filter(&self, ip: IpAddr) -> Result<(), String> {
        self.filter_limiter
            .check_key(&ip)
            .map_err(|_| "rate limited: too many filters".to_string())
    }
}

impl Default for PolicyLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Event-validity caps enforced before publish fan-out. Returns the
/// exact `"blocked: ..."` message for the first violated rule, checked
/// in the order below.
pub fn validate_event(event: &Event, now: i64) -> Result<(), String> {
    if event.content.len() > MAX_CONTENT_BYTES {
        return Err("blocked: event content too large".to_string());
    }
    if event.tags.len() > MAX_TAG_COUNT {
        return Err("blocked: too many tags".to_string());
    }
    if event.created_at > now + FUTURE_SLACK_SECS {
        return Err("blocked: event timestamp too far in future".to_string());
    }
    if event.created_at < now - PAST_SLACK_SECS {
        return Err("blocked: event timestamp too far in past".to_string());
    }
    if event.kind > MAX_KIND {
        return Err("blocked: invalid event kind".to_string());
    }
    if event.content.is_empty() && event.tags.len() > EMPTY_CONTENT_TAG_THRESHOLD {
        return Err("blocked: empty content with excessive tags".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventId, Tag};

    fn base_event() -> Event {
        Event {
            id: EventId::from("id"),
            pubkey: "pk".to_string(),
            created_at: 1_000,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn valid_event_passes() {
        assert!(validate_event(&base_event(), 1_000).is_ok());
    }

    #[test]
    fn oversized_content_is_blocked() {
        let mut event = base_event();
        event.content = "a".repeat(MAX_CONTENT_BYTES + 1);
        assert_eq!(validate_event(&event, 1_000), Err("blocked: event content too large".to_string()));
    }

    #[test]
    fn too_many_tags_is_blocked() {
        let mut event = base_event();
        event.tags = (0..MAX_TAG_COUNT + 1).map(|i| Tag(vec!["t".to_string(), i.to_string()])).collect();
        assert_eq!(validate_event(&event, 1_000), Err("blocked: too many tags".to_string()));
    }

    #[test]
    fn future_timestamp_is_blocked() {
        let mut event = base_event();
        event.created_at = 1_000 + FUTURE_SLACK_SECS + 1;
        assert_eq!(validate_event(&event, 1_000), Err("blocked: event timestamp too far in future".to_string()));
    }

    #[test]
    fn past_timestamp_is_blocked() {
        let mut event = base_event();
        event.created_at = 1_000 - PAST_SLACK_SECS - 1;
        assert_eq!(validate_event(&event, 1_000), Err("blocked: event timestamp too far in past".to_string()));
    }

    #[test]
    fn invalid_kind_is_blocked() {
        let mut event = base_event();
        event.kind = MAX_KIND + 1;
        assert_eq!(validate_event(&event, 1_000), Err("blocked: invalid event kind".to_string()));
    }

    #[test]
    fn empty_content_with_excessive_tags_is_blocked() {
        let mut event = base_event();
        event.content = String::new();
        event.tags = (0..EMPTY_CONTENT_TAG_THRESHOLD + 1).map(|i| Tag(vec!["t".to_string(), i.to_string()])).collect();
        assert_eq!(
            validate_event(&event, 1_000),
            Err("blocked: empty content with excessive tags".to_string())
        );
    }

    #[test]
    fn connection_limiter_allows_then_denies_burst() {
        let policy = PolicyLayer::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..CONNECTION_BURST.get() {
            assert!(policy.check_connection(ip).is_ok());
        }
        assert!(policy.check_connection(ip).is_err());
    }
}
