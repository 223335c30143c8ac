use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use super::state::ApiState;
use super::tasks::parse_tenant;
use super::types::EventsQuery;
use crate::api_error::ApiError;

const EVENTS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket GET /api/events/ws -- read-only event stream for dashboards.
///
/// `?tenant_id=` narrows the stream to one tenant.
pub(crate) async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let filter = query.tenant_id.as_deref().map(parse_tenant).transpose()?;
    Ok(ws
        .on_upgrade(move |socket| handle_events_ws(socket, state, filter))
        .into_response())
}

async fn handle_events_ws(
    socket: WebSocket,
    state: Arc<ApiState>,
    filter: Option<ad_core::types::TenantId>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let rx = state.events.subscribe();
    let mut heartbeat = tokio::time::interval(EVENTS_HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            result = rx.recv_async() => {
                let Ok(event) = result else { break };
                if filter.as_ref().is_some_and(|t| event.tenant_id() != t) {
                    continue;
                }
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!(error = %e, "event not serializable");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!("events websocket closed");
}
