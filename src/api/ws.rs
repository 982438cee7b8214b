// =============================================================================
// WebSocket handler — live event fan-out
// =============================================================================
//
// Clients connect to `/ws/live[?channels=STRATEGY_STARTED,ORDER_SUBMITTED]`
// and are subscribed to the event bus for the life of the connection. Every
// `EngineEvent` the engine publishes is forwarded as JSON, filtered against
// the connection's channel set (empty = everything). The set can be changed
// mid-connection via control messages: text `ping` gets a `pong`; a JSON
// `{"subscribe": [...]}` replaces the set; `{"unsubscribe": [...]}` removes
// channels from it; anything else unparseable gets a JSON error frame.
// Unsubscribes from the event bus on disconnect so it never fans out to a
// dead socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::types::EngineEventKind;

#[derive(Deserialize)]
pub struct WsQuery {
    /// Comma-separated `EngineEventKind` names, e.g. `STRATEGY_STARTED,RISK_REJECTED`.
    channels: Option<String>,
}

/// Incoming control frame per 4.J. Exactly one of `subscribe`/`unsubscribe`
/// is expected; both absent is treated as unparseable.
#[derive(Deserialize)]
struct ControlMessage {
    #[serde(default)]
    subscribe: Option<Vec<EngineEventKind>>,
    #[serde(default)]
    unsubscribe: Option<Vec<EngineEventKind>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/ws/live", get(ws_handler)).with_state(state)
}

fn parse_channels(raw: &str) -> Vec<EngineEventKind> {
    raw.split(',')
        .filter_map(|s| {
            let quoted = format!("\"{}\"", s.trim());
            serde_json::from_str::<EngineEventKind>(&quoted).ok()
        })
        .collect()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let filter = query.channels.as_deref().map(parse_channels).unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

/// Handles one incoming text frame. Returns `false` if the socket send
/// failed and the connection loop should stop.
async fn handle_control_text(text: &str, filter: &mut Vec<EngineEventKind>, socket: &mut WebSocket) -> bool {
    if text.trim() == "ping" {
        return socket.send(Message::Text("pong".to_string())).await.is_ok();
    }

    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage { subscribe: Some(channels), .. }) => {
            *filter = channels;
            true
        }
        Ok(ControlMessage { unsubscribe: Some(channels), .. }) => {
            filter.retain(|c| !channels.contains(c));
            true
        }
        Ok(_) => {
            let err = json!({"error": "control message must set 'subscribe' or 'unsubscribe'"});
            socket.send(Message::Text(err.to_string())).await.is_ok()
        }
        Err(e) => {
            let err = json!({"error": format!("unparseable control message: {e}")});
            socket.send(Message::Text(err.to_string())).await.is_ok()
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, mut filter: Vec<EngineEventKind>) {
    let (sub_id, mut rx) = state.event_bus.subscribe();
    info!(subscriber_id = sub_id, channels = ?filter, "ws client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !filter.is_empty() && !filter.contains(&event.event) {
                    continue;
                }
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize engine event for ws push");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(text))) => {
                        if !handle_control_text(&text, &mut filter, &mut socket).await {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber_id = sub_id, error = %e, "ws recv error");
                        break;
                    }
                }
            }
        }
    }

    state.event_bus.unsubscribe(sub_id);
    info!(subscriber_id = sub_id, "ws client disconnected");
}
