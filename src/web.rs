//! Client-facing WebSocket wire protocol and read-only REST API.
//!
//! Structurally mirrors `freeq_server::web`: a single axum `Router` with
//! one upgrade endpoint and a couple of JSON REST handlers reading off
//! `SharedState`. Unlike that file there is no bridge to another
//! protocol handler — the wire messages are handled directly here, since
//! this relay speaks only one protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::classifier::RequestContext;
use crate::model::{ClientMessage, Event, Filter, RelayMessage};
use crate::ordered_json::OrderedJson;
use crate::policy::validate_event;
use crate::server::SharedState;
use crate::stats::registry as stats_registry;

const QUERY_DEADLINE: Duration = Duration::from_secs(30);
const PUBLISH_DEADLINE: Duration = Duration::from_secs(7);
const COUNT_DEADLINE: Duration = Duration::from_secs(10);

pub async fn serve(state: Arc<SharedState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(root))
        .route("/api/v1/stats", get(api_stats))
        .route("/api/v1/health", get(api_health))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.addr).await?;
    info!(addr = %state.config.addr, "relay listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// `GET /` — upgrades to the wire protocol if the client asks for a
/// WebSocket; otherwise serves the NIP-11 relay information document.
async fn root(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if let Some(ws) = ws {
        if let Err(reason) = state.policy.check_connection(addr.ip()) {
            return (StatusCode::TOO_MANY_REQUESTS, reason).into_response();
        }
        return ws.on_upgrade(move |socket| handle_socket(socket, state, addr)).into_response();
    }
    let _ = headers;
    Json(relay_information(&state)).into_response()
}

fn relay_information(state: &SharedState) -> OrderedJson {
    OrderedJson::object()
        .field("name", state.config.relay_name.as_str())
        .field("description", state.config.relay_description.as_str())
        .field("pubkey", state.config.relay_pubkey.clone().unwrap_or_default())
        .field("contact", state.config.relay_contact.as_str())
        .field(
            "supported_nips",
            vec![OrderedJson::Int(1), OrderedJson::Int(11), OrderedJson::Int(42), OrderedJson::Int(45)],
        )
        .field("software", "relay-mesh")
        .field("version", env!("CARGO_PKG_VERSION"))
        .build()
}

async fn api_stats(State(_state): State<Arc<SharedState>>) -> Json<OrderedJson> {
    Json(stats_registry().all_stats())
}

async fn api_health(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    let publish = state.broadcast.publish_failure_counter.health();
    let query = state.aggregator.failure_counter.health();
    let mirror = state.mirror.failure_counter.health();
    let broadcast = state.broadcast.broadcast_failure_counter.health();
    let main = state.overall_health();

    let body = OrderedJson::object()
        .field("status", if main.http_status() == 200 { "ok" } else { "degraded" })
        .field("service", state.config.relay_name.as_str())
        .field("version", env!("CARGO_PKG_VERSION"))
        .field("main_health_state", main.as_str())
        .field("publish_health_state", publish.as_str())
        .field("query_health_state", query.as_str())
        .field("mirror_health_state", mirror.as_str())
        .field("broadcast_health_state", broadcast.as_str())
        .field("consecutive_publish_failures", state.broadcast.publish_failure_counter.get())
        .field("consecutive_query_failures", state.aggregator.failure_counter.get())
        .field("consecutive_mirror_failures", state.mirror.failure_counter.get())
        .field("consecutive_broadcast_failures", state.broadcast.broadcast_failure_counter.get())
        .build();

    (StatusCode::from_u16(main.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(body))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<SharedState>, addr: SocketAddr) {
    state.task_counter.increment();
    loop {
        let frame = match socket.recv().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(peer = %addr, error = %e, "client WS read error");
                break;
            }
        };

        let parsed: Result<ClientMessage, _> = serde_json::from_str(&frame);
        let Ok(message) = parsed else {
            let notice = RelayMessage::Notice { message: "invalid: malformed client message".to_string() };
            let _ = send(&mut socket, &notice).await;
            continue;
        };

        match message {
            ClientMessage::Event { event } => handle_publish(&mut socket, &state, event).await,
            ClientMessage::Req { sub_id, filters } => {
                handle_req(&mut socket, &state, addr, sub_id, filters, false).await
            }
            ClientMessage::Count { sub_id, filters } => {
                handle_req(&mut socket, &state, addr, sub_id, filters, true).await
            }
            ClientMessage::Close { .. } => {}
        }
    }
    state.task_counter.decrement();
}

async fn handle_publish(socket: &mut WebSocket, state: &Arc<SharedState>, event: Event) {
    let now = chrono::Utc::now().timestamp();
    if let Err(reason) = validate_event(&event, now) {
        let ok = RelayMessage::Ok { event_id: event.id, accepted: false, message: reason };
        let _ = send(socket, &ok).await;
        return;
    }

    if event.kind == 5 {
        run_deletion_bookkeeping(state, &event).await;
    }

    let event_id = event.id.clone();
    match state.broadcast.publish(event, PUBLISH_DEADLINE).await {
        Ok(()) => {
            let ok = RelayMessage::Ok { event_id, accepted: true, message: String::new() };
            let _ = send(socket, &ok).await;
        }
        Err(e) => {
            let ok = RelayMessage::Ok { event_id, accepted: false, message: e.to_string() };
            let _ = send(socket, &ok).await;
        }
    }
}

async fn handle_req(
    socket: &mut WebSocket,
    state: &Arc<SharedState>,
    addr: SocketAddr,
    sub_id: String,
    filters: Vec<Filter>,
    is_count: bool,
) {
    if let Err(reason) = state.policy.check_filter(addr.ip()) {
        let _ = send(socket, &RelayMessage::Notice { message: reason }).await;
        return;
    }

    // A client-driven REQ/COUNT always carries a subscription id, so the
    // deletion-check short-circuit (which requires its absence) only ever
    // fires for the framework's own internal bookkeeping calls, not here.
    let filter = filters.into_iter().next().unwrap_or_default();
    let ctx = RequestContext { internal_marker: false, sub_id: Some(sub_id.clone()) };

    if is_count {
        let count = state.aggregator.count_checked(filter, &ctx, COUNT_DEADLINE).await.unwrap_or(0);
        let _ = send(socket, &RelayMessage::Count { sub_id, count }).await;
        return;
    }

    let Ok((mut events, _cancel)) = state.aggregator.query_checked(filter, &ctx, QUERY_DEADLINE).await else {
        let _ = send(socket, &RelayMessage::Eose { sub_id }).await;
        return;
    };

    while let Some(event) = events.recv().await {
        let msg = RelayMessage::Event { sub_id: sub_id.clone(), event };
        if send(socket, &msg).await.is_err() {
            return;
        }
    }
    let _ = send(socket, &RelayMessage::Eose { sub_id }).await;
}

/// Deletion events (kind 5) trigger the framework's own bookkeeping query
/// for the referenced event — issued with no subscription-id context, so
/// the classifier's deletion-check short-circuit applies and no upstream
/// is ever contacted for it.
async fn run_deletion_bookkeeping(state: &Arc<SharedState>, event: &Event) {
    let Some(target) = event.tag_value("e") else { return };
    let mut tags = std::collections::BTreeMap::new();
    tags.insert("#e".to_string(), vec![target.to_string()]);
    let filter = Filter { kinds: vec![5], tags, ..Default::default() };
    let ctx = RequestContext { internal_marker: false, sub_id: None };
    let _ = state.aggregator.count_checked(filter, &ctx, Duration::from_secs(1)).await;
}

async fn send(socket: &mut WebSocket, msg: &RelayMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    socket.send(WsMessage::Text(text.into())).await
}
