//! Peer-connection registry (component A).
//!
//! Keyed-by-URL WebSocket session cache, following the same shape as
//! `UpstreamManager` in the federation-upstream reference: a read-locked
//! fast path for a live session, an exclusive-locked slow path that dials
//! and inserts on miss, and a background reader task per connection once
//! established. Unlike that reference we don't refcount or grace-period
//! tear down sessions — liveness is re-checked on every `acquire`, so a
//! session simply gets redialed in place when it goes stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use tungstenite::Message as WsMessage;

use crate::error::CoreError;
use crate::model::{ClientMessage, Event, RelayMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait right after connect for an upstream's unprompted
/// NIP-42 `["AUTH", challenge]` frame before giving up and continuing
/// unauthenticated.
const AUTH_CHALLENGE_WAIT: Duration = Duration::from_millis(500);

/// A live connection to one upstream peer. Reads run on a background task
/// that forwards parsed `RelayMessage`s into `inbox`; writes go straight
/// over `writer` under a mutex since publish/query calls only ever send
/// one frame at a time per session.
pub struct Session {
    url: String,
    writer: AsyncMutex<futures_util::stream::SplitSink<WsStream, WsMessage>>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<RelayMessage>>,
    alive: Arc<AtomicBool>,
}

impl Session {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub async fn send_client_message(&self, msg: &ClientMessage) -> Result<(), CoreError> {
        let text = serde_json::to_string(msg).map_err(|e| CoreError::PeerTransport {
            peer: self.url.clone(),
            reason: e.to_string(),
        })?;
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Text(text.into())).await.map_err(|e| {
            self.alive.store(false, Ordering::Relaxed);
            CoreError::PeerTransport {
                peer: self.url.clone(),
                reason: e.to_string(),
            }
        })
    }

    pub async fn recv(&self, deadline: Duration) -> Option<RelayMessage> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(deadline, inbox.recv()).await.ok().flatten()
    }
}

/// Parses raw frames off the wire into `RelayMessage`s and forwards them.
/// Marks `alive` false and exits on any read error or stream close.
async fn reader_task(
    mut reader: futures_util::stream::SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<RelayMessage>,
    alive: Arc<AtomicBool>,
    peer: String,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match parse_relay_message(&text) {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(peer = %peer, error = %e, "unparseable upstream frame"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(peer = %peer, error = %e, "upstream read error");
                break;
            }
        }
    }
    alive.store(false, Ordering::Relaxed);
}

fn parse_relay_message(text: &str) -> Result<RelayMessage, serde_json::Error> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let tag = raw.first().and_then(|v| v.as_str()).unwrap_or_default();
    let rebuilt = serde_json::Value::Array(raw);
    match tag {
        "EVENT" => {
            let arr = rebuilt.as_array().unwrap();
            let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let event: Event = serde_json::from_value(arr.get(2).cloned().unwrap_or_default())?;
            Ok(RelayMessage::Event { sub_id, event })
        }
        "EOSE" => {
            let arr = rebuilt.as_array().unwrap();
            let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(RelayMessage::Eose { sub_id })
        }
        "OK" => {
            let arr = rebuilt.as_array().unwrap();
            let event_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default().into();
            let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(RelayMessage::Ok { event_id, accepted, message })
        }
        "COUNT" => {
            let arr = rebuilt.as_array().unwrap();
            let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let count = arr
                .get(2)
                .and_then(|v| v.get("count"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Ok(RelayMessage::Count { sub_id, count })
        }
        "NOTICE" => {
            let arr = rebuilt.as_array().unwrap();
            let message = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(RelayMessage::Notice { message })
        }
        "AUTH" => {
            let arr = rebuilt.as_array().unwrap();
            let challenge = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(RelayMessage::Auth { challenge })
        }
        other => Err(serde::de::Error::custom(format!("unrecognized frame tag {other}"))),
    }
}

/// Signs and sends an AUTH challenge-response event, then awaits the
/// resulting OK. Failure is swallowed by the caller (`acquire`) — an auth
/// failure never fails the overall dial.
async fn authenticate(
    session: &Session,
    challenge: &str,
    seckey: &[u8; 32],
    relay_url: &str,
) -> Result<(), CoreError> {
    let event = crate::auth::build_auth_event(seckey, relay_url, challenge)?;
    session
        .send_client_message(&ClientMessage::Event { event: event.clone() })
        .await?;
    match session.recv(Duration::from_secs(5)).await {
        Some(RelayMessage::Ok { accepted: true, .. }) => Ok(()),
        Some(RelayMessage::Ok { accepted: false, message, .. }) => {
            Err(CoreError::PeerTransport { peer: relay_url.to_string(), reason: message })
        }
        _ => Err(CoreError::PeerTransport {
            peer: relay_url.to_string(),
            reason: "no AUTH response before deadline".to_string(),
        }),
    }
}

/// Keyed session cache: read-locked lookup, write-locked dial-and-insert
/// on miss or dead entry.
pub struct PeerRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    seckey: Option<[u8; 32]>,
}

impl PeerRegistry {
    pub fn new(seckey: Option<[u8; 32]>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            seckey,
        }
    }

    /// `Acquire(url, deadline)`. Returns a cached session iff it is live;
    /// otherwise dials a fresh one within `deadline`.
    pub async fn acquire(&self, url: &str, deadline: Duration) -> Result<Arc<Session>, CoreError> {
        if let Some(session) = self.sessions.read().get(url).cloned() {
            if session.is_live() {
                return Ok(session);
            }
        }
        self.dial(url, deadline).await
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.sessions.read().get(url).map(|s| s.is_live()).unwrap_or(false)
    }

    /// Drops every cached session. Idempotent.
    pub fn close(&self) {
        self.sessions.write().clear();
    }

    async fn dial(&self, url: &str, deadline: Duration) -> Result<Arc<Session>, CoreError> {
        let connect = connect_async(url);
        let (ws, _resp) = tokio::time::timeout(deadline, connect)
            .await
            .map_err(|_| CoreError::PeerTransport {
                peer: url.to_string(),
                reason: "connect deadline exceeded".to_string(),
            })?
            .map_err(|e| CoreError::PeerTransport {
                peer: url.to_string(),
                reason: e.to_string(),
            })?;

        let (writer, reader) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let session = Arc::new(Session {
            url: url.to_string(),
            writer: AsyncMutex::new(writer),
            inbox: AsyncMutex::new(rx),
            alive: alive.clone(),
        });

        tokio::spawn(reader_task(reader, tx, alive, url.to_string()));

        {
            let mut sessions = self.sessions.write();
            sessions.insert(url.to_string(), session.clone());
        }

        if let Some(seckey) = self.seckey {
            match session.recv(AUTH_CHALLENGE_WAIT).await {
                Some(RelayMessage::Auth { challenge }) => {
                    if let Err(e) = authenticate(&session, &challenge, &seckey, url).await {
                        warn!(peer = url, error = %e, "upstream auth failed, continuing unauthenticated");
                    }
                }
                _ => debug!(peer = url, "no AUTH challenge from upstream, continuing unauthenticated"),
            }
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let registry = PeerRegistry::new(None);
        assert!(!registry.is_live("wss://example.invalid"));
    }

    #[test]
    fn close_clears_cached_sessions() {
        let registry = PeerRegistry::new(None);
        registry.close();
        assert!(!registry.is_live("wss://example.invalid"));
    }

    #[test]
    fn parses_auth_frame() {
        let msg = parse_relay_message(r#"["AUTH","challenge-xyz"]"#).unwrap();
        match msg {
            RelayMessage::Auth { challenge } => assert_eq!(challenge, "challenge-xyz"),
            other => panic!("expected Auth, got {other:?}"),
        }
    }
}
