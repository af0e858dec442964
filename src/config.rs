//! Startup configuration.
//!
//! Mirrors `freeq_server::config::ServerConfig`'s shape: a `clap::Parser`
//! struct with `env = "..."` on every field, so a flag always wins over
//! the corresponding environment variable via clap's own precedence.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "relay-mesh", about = "Event-relay aggregator")]
pub struct RelayConfig {
    /// Listening address for the client-facing HTTP/WebSocket endpoint.
    #[arg(long, env = "ADDR", default_value = "0.0.0.0:7000")]
    pub addr: String,

    /// Comma-separated upstream relay URLs used for QUERY/COUNT fan-out
    /// and mirroring. Mandatory — startup aborts if empty.
    #[arg(long, env = "QUERY_REMOTES", value_delimiter = ',')]
    pub query_remotes: Vec<String>,

    /// Logging filter: empty = off, "1"/"true"/"all" = everything, else a
    /// comma list of `module` or `module.method` tokens.
    #[arg(long, env = "VERBOSE", default_value = "")]
    pub verbose: String,

    #[arg(long, env = "RELAY_NAME", default_value = "relay-mesh")]
    pub relay_name: String,
    #[arg(long, env = "RELAY_DESCRIPTION", default_value = "")]
    pub relay_description: String,
    #[arg(long, env = "RELAY_CONTACT", default_value = "")]
    pub relay_contact: String,
    #[arg(long, env = "RELAY_ICON", default_value = "")]
    pub relay_icon: String,
    #[arg(long, env = "RELAY_BANNER", default_value = "")]
    pub relay_banner: String,
    #[arg(long, env = "RELAY_SERVICE_URL", default_value = "")]
    pub relay_service_url: String,

    /// Upstream-auth private key: raw hex or bech32 `nsec1...`.
    #[arg(long, env = "RELAY_SECKEY")]
    pub relay_seckey: Option<String>,

    /// Derived from `relay_seckey` if absent.
    #[arg(long, env = "RELAY_PUBKEY")]
    pub relay_pubkey: Option<String>,

    #[arg(long, env = "MAX_PUBLISH_RELAYS", default_value_t = 50)]
    pub max_publish_relays: usize,

    /// Exponential-average factor applied to each peer's success rate
    /// after every publish attempt.
    #[arg(long, env = "SUCCESS_RATE_DECAY", default_value_t = 0.9)]
    pub success_rate_decay: f64,

    /// Defaults to `2 * num_cpus` when unset; `0` is treated as "use the
    /// default" rather than a literal zero-worker pool.
    #[arg(long, env = "BROADCAST_WORKERS", default_value_t = 0)]
    pub broadcast_workers: usize,

    #[arg(long, env = "BROADCAST_CACHE_TTL", value_parser = humantime_secs, default_value = "5m")]
    pub broadcast_cache_ttl: Duration,

    #[arg(long, env = "BROADCAST_SEED_RELAYS", value_delimiter = ',')]
    pub broadcast_seed_relays: Vec<String>,

    #[arg(long, env = "BROADCAST_MANDATORY_RELAYS", value_delimiter = ',')]
    pub broadcast_mandatory_relays: Vec<String>,

    #[arg(long, env = "BROADCAST_REFRESH_INTERVAL", value_parser = humantime_secs, default_value = "24h")]
    pub broadcast_refresh_interval: Duration,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, env = "RELAY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Parse a small subset of durations (`"7s"`, `"5m"`, `"24h"`) without
/// pulling in a dedicated duration-parsing crate.
fn humantime_secs(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.len() - 1.min(s.len()));
    let (num_str, mult) = match s.chars().last() {
        Some('s') => (num, 1u64),
        Some('m') => (num, 60u64),
        Some('h') => (num, 3600u64),
        Some('d') => (num, 86_400u64),
        _ => (s, 1u64),
    };
    let _ = unit;
    let n: u64 = num_str.parse().map_err(|_| format!("invalid duration: {s}"))?;
    Ok(Duration::from_secs(n * mult))
}

impl RelayConfig {
    pub fn broadcast_worker_count(&self) -> usize {
        if self.broadcast_workers == 0 {
            2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.broadcast_workers
        }
    }

    pub fn broadcast_enabled(&self) -> bool {
        !self.broadcast_seed_relays.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_remotes.is_empty() {
            bail!("QUERY_REMOTES must be non-empty: at least one upstream query relay is required");
        }
        if !(self.success_rate_decay > 0.0 && self.success_rate_decay < 1.0) {
            bail!("SUCCESS_RATE_DECAY must be strictly between 0 and 1, got {}", self.success_rate_decay);
        }
        validate_peer_urls("QUERY_REMOTES", &self.query_remotes)?;
        validate_peer_urls("BROADCAST_SEED_RELAYS", &self.broadcast_seed_relays)?;
        validate_peer_urls("BROADCAST_MANDATORY_RELAYS", &self.broadcast_mandatory_relays)?;
        Ok(())
    }

    /// Decode `relay_seckey` (hex or bech32 `nsec1...`) into 32 raw bytes.
    pub fn decode_seckey(&self) -> Result<Option<[u8; 32]>> {
        let Some(raw) = &self.relay_seckey else {
            return Ok(None);
        };
        decode_secret_key(raw).map(Some)
    }
}

/// Every configured peer URL must parse and carry a `ws`/`wss` scheme —
/// the registry dials these directly with `tokio_tungstenite::connect_async`.
fn validate_peer_urls(field: &str, urls: &[String]) -> Result<()> {
    for raw in urls {
        let parsed = url::Url::parse(raw).with_context(|| format!("{field} entry {raw:?} is not a valid URL"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            bail!("{field} entry {raw:?} must use the ws:// or wss:// scheme, got {:?}", parsed.scheme());
        }
    }
    Ok(())
}

fn decode_secret_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = if raw.starts_with("nsec1") {
        let (hrp, data) = bech32::decode(raw).context("invalid bech32 nsec key")?;
        if hrp.as_str() != "nsec" {
            bail!("expected nsec1... human-readable part, got {hrp}");
        }
        data
    } else {
        hex::decode(raw).context("RELAY_SECKEY is neither valid hex nor bech32")?
    };
    if bytes.len() != 32 {
        bail!("secret key must decode to exactly 32 bytes, got {}", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Build a `tracing_subscriber::EnvFilter` directive string from the
/// `VERBOSE` option.
pub fn verbose_to_filter(verbose: &str) -> String {
    let v = verbose.trim();
    if v.is_empty() {
        "off".to_string()
    } else if v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("all") {
        "relay_mesh=debug".to_string()
    } else {
        v.split(',')
            .map(|tok| format!("relay_mesh::{}=debug", tok.trim()))
            .collect::<Vec<_>>()
            .join(",")
    }
}
