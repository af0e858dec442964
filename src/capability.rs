//! NIP-11 capability probe (component G): at startup, checks each query
//! peer's relay metadata document for COUNT (NIP 45) support.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(4);
const METADATA_ACCEPT_HEADER: &str = "application/nostr+json";
const COUNT_NIP: u32 = 45;

#[derive(Debug, Deserialize)]
struct RelayInformation {
    #[serde(default)]
    supported_nips: Vec<u32>,
}

/// Probes every peer, returning the subset that advertises COUNT
/// support. Any non-200, timeout, or parse error silently excludes that
/// peer from the result without treating it as an overall failure.
pub async fn probe_countable_peers(client: &reqwest::Client, peers: &[String]) -> HashSet<String> {
    let mut countable = HashSet::new();
    for peer in peers {
        if probe_one(client, peer).await {
            countable.insert(peer.clone());
        }
    }
    countable
}

async fn probe_one(client: &reqwest::Client, peer: &str) -> bool {
    let http_url = to_http_url(peer);
    let request = client
        .get(&http_url)
        .header("Accept", METADATA_ACCEPT_HEADER)
        .timeout(PROBE_TIMEOUT)
        .send();

    let response = match request.await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            debug!(peer, status = %resp.status(), "capability probe non-200, excluding from countable set");
            return false;
        }
        Err(e) if e.is_timeout() => {
            debug!(peer, "capability probe timed out");
            return false;
        }
        Err(e) => {
            debug!(peer, error = %e, "capability probe request failed");
            return false;
        }
    };

    match response.json::<RelayInformation>().await {
        Ok(info) => info.supported_nips.contains(&COUNT_NIP),
        Err(e) => {
            debug!(peer, error = %e, "capability probe body did not parse as relay information");
            false
        }
    }
}

/// `ws://` -> `http://`, `wss://` -> `https://`; anything else is passed
/// through unchanged (the probe will simply fail to connect).
fn to_http_url(peer: &str) -> String {
    let Ok(mut url) = url::Url::parse(peer) else {
        return peer.to_string();
    };
    let new_scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return peer.to_string(),
    };
    // ws/wss and http/https are all WHATWG "special" schemes, so this
    // transition is always permitted.
    let _ = url.set_scheme(new_scheme);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wss_maps_to_https() {
        assert_eq!(to_http_url("wss://relay.example/"), "https://relay.example/");
    }

    #[test]
    fn ws_maps_to_http() {
        assert_eq!(to_http_url("ws://relay.example/"), "http://relay.example/");
    }

    #[test]
    fn unrecognized_scheme_passes_through() {
        assert_eq!(to_http_url("https://relay.example/"), "https://relay.example/");
    }

    #[tokio::test]
    async fn probe_excludes_unreachable_peer() {
        let client = reqwest::Client::new();
        let countable = probe_countable_peers(&client, &["ws://127.0.0.1:1".to_string()]).await;
        assert!(countable.is_empty());
    }
}
