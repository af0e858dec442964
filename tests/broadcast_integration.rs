//! In-process acceptance tests for publish fan-out, auth retry, and
//! capability probing.
//!
//! Grounded on `tests/s2s_acceptance.rs`'s approach of standing up real
//! listeners and driving the system under test against live sockets,
//! scaled down to single-process mock peers instead of two full servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use relay_mesh::broadcast::BroadcastStore;
use relay_mesh::capability::probe_countable_peers;
use relay_mesh::error::CoreError;
use relay_mesh::model::{Event, EventId, Tag};
use relay_mesh::registry::PeerRegistry;

const EVENT_ID: &str = "deadbeefcafe";

fn sample_event() -> Event {
    Event {
        id: EventId::from(EVENT_ID),
        pubkey: "pubkey".to_string(),
        created_at: 1_700_000_000,
        kind: 1,
        tags: vec![Tag(vec!["e".to_string(), "parent".to_string()])],
        content: "hello mesh".to_string(),
        sig: "sig".to_string(),
    }
}

fn ok_frame(event_id: &str, accepted: bool, message: &str) -> String {
    serde_json::json!(["OK", event_id, accepted, message]).to_string()
}

fn auth_frame(challenge: &str) -> String {
    serde_json::json!(["AUTH", challenge]).to_string()
}

/// A single-shot scripted WebSocket peer: reads one text frame, sends
/// back `reply`, then closes. Used for the single-round-trip fan-out
/// tests where one publish attempt gets exactly one response.
async fn spawn_single_reply_peer(reply: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock peer");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
        let Some(Ok(WsMessage::Text(_))) = ws.next().await else { return };
        let _ = ws.send(WsMessage::Text(reply.into())).await;
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn publish_fanout_accepts_when_any_peer_accepts() {
    let accepting = spawn_single_reply_peer(ok_frame(EVENT_ID, true, "")).await;
    let rejecting = spawn_single_reply_peer(ok_frame(EVENT_ID, false, "blocked: spam")).await;

    let registry = Arc::new(PeerRegistry::new(None));
    let store = BroadcastStore::new(
        registry,
        vec![accepting, rejecting],
        0,
        1,
        Duration::from_secs(60),
        0.9,
        None,
    );

    let result = store.publish(sample_event(), Duration::from_secs(10)).await;
    assert!(result.is_ok(), "expected at least one peer to accept: {result:?}");
    assert_eq!(store.publish_failure_counter.get(), 0);
}

#[tokio::test]
async fn publish_fanout_reports_a_prefixed_error_when_every_peer_rejects() {
    let blocked = spawn_single_reply_peer(ok_frame(EVENT_ID, false, "blocked: spam")).await;
    let limited = spawn_single_reply_peer(ok_frame(EVENT_ID, false, "rate-limited: slow down")).await;

    let registry = Arc::new(PeerRegistry::new(None));
    let store = BroadcastStore::new(registry, vec![blocked, limited], 0, 1, Duration::from_secs(60), 0.9, None);

    let result = store.publish(sample_event(), Duration::from_secs(10)).await;
    let err = result.expect_err("expected every peer to reject the publish");
    match err {
        CoreError::PeerSemantic(prefixed) => {
            // Which peer's prefix is surfaced first is implementation's
            // choice (see DESIGN.md's Open Questions); only membership is
            // guaranteed.
            assert!(
                prefixed.message == "blocked: spam" || prefixed.message == "rate-limited: slow down",
                "unexpected message: {}",
                prefixed.message
            );
        }
        other => panic!("expected PeerSemantic, got {other:?}"),
    }
    assert_eq!(store.publish_failure_counter.get(), 1);
}

/// Scripts the three-frame auth-retry exchange: reject with
/// `auth-required`, send the real NIP-42 `["AUTH", challenge]` frame,
/// silently accept the AUTH event, then accept the retried publish.
async fn spawn_auth_challenge_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock peer");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };

        let Some(Ok(WsMessage::Text(_))) = ws.next().await else { return };
        let _ = ws
            .send(WsMessage::Text(
                ok_frame(EVENT_ID, false, "auth-required: please authenticate").into(),
            ))
            .await;
        let _ = ws.send(WsMessage::Text(auth_frame("challenge-xyz").into())).await;

        let Some(Ok(WsMessage::Text(_))) = ws.next().await else { return };

        let Some(Ok(WsMessage::Text(_))) = ws.next().await else { return };
        let _ = ws.send(WsMessage::Text(ok_frame(EVENT_ID, true, "").into())).await;
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn publish_retries_once_after_auth_required_and_then_succeeds() {
    let peer = spawn_auth_challenge_peer().await;

    let registry = Arc::new(PeerRegistry::new(None));
    let seckey = [7u8; 32];
    let store = BroadcastStore::new(registry, vec![peer], 0, 1, Duration::from_secs(60), 0.9, Some(seckey));

    let result = store.publish(sample_event(), Duration::from_secs(10)).await;
    assert!(result.is_ok(), "expected the retried publish to succeed: {result:?}");
}

/// Minimal hand-rolled HTTP/1.1 response: just enough for `reqwest` to
/// parse a 200 with a JSON body advertising NIP support.
async fn spawn_nip11_peer(supported_nips: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock relay-info server");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else { return };
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let body = format!("{{\"supported_nips\":{supported_nips}}}");
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/nostr+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn capability_probe_includes_peer_advertising_count_support() {
    let countable_peer = spawn_nip11_peer("[1, 11, 45]").await;
    let bare_peer = spawn_nip11_peer("[1, 11]").await;

    let client = reqwest::Client::new();
    let countable = probe_countable_peers(&client, &[countable_peer.clone(), bare_peer.clone()]).await;

    assert!(countable.contains(&countable_peer));
    assert!(!countable.contains(&bare_peer));
}
