//! Remote browser agent WebSocket: `GET /ws/agent/{tenant}`.
//!
//! One socket per tenant. Commands queued on the hub are forwarded as JSON
//! text frames; agent frames are parsed and handed to the hub. Closing the
//! socket (or going idle) disconnects the session, which fails any pending
//! login instead of leaving it to time out.

use std::sync::Arc;
use std::time::Duration;

use ad_core::types::TenantId;
use ad_session::protocol::{AgentMessage, ServerCommand};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::api_error::ApiError;
use crate::http_api::ApiState;

/// Idle limit for agent traffic. Pong replies to the heartbeat count as
/// traffic, so a healthy agent never hits it.
const AGENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
) -> Result<Response, ApiError> {
    let tenant = TenantId::parse(&tenant)?;
    Ok(ws
        .on_upgrade(move |socket| handle_agent_ws(socket, state, tenant))
        .into_response())
}

async fn handle_agent_ws(socket: WebSocket, state: Arc<ApiState>, tenant: TenantId) {
    let (ws_sender, mut ws_receiver) = socket.split();

    // Shared by the command forwarder and the heartbeat.
    let ws_sender = Arc::new(tokio::sync::Mutex::new(ws_sender));

    let (cmd_tx, cmd_rx) = flume::unbounded::<ServerCommand>();
    let conn = state.hub.on_connect(&tenant, cmd_tx);
    state.refresh_gauges();

    // Task: hub commands -> WS
    let sender = Arc::clone(&ws_sender);
    let forward_tenant = tenant.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok(cmd) = cmd_rx.recv_async().await {
            let text = match cmd.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(tenant_id = %forward_tenant, error = %e, "command not encodable");
                    continue;
                }
            };
            if sender
                .lock()
                .await
                .send(Message::Text(text.into()))
                .await
                .is_err()
            {
                debug!(tenant_id = %forward_tenant, "agent socket closed while sending");
                break;
            }
        }
    });

    // Task: WS -> hub
    let hub = Arc::clone(&state.hub);
    let reader_tenant = tenant.clone();
    let reader = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(AGENT_IDLE_TIMEOUT, ws_receiver.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => match AgentMessage::parse(&text) {
                    Ok(message) => hub.on_message(&reader_tenant, message),
                    Err(e) => {
                        warn!(tenant_id = %reader_tenant, error = %e, "unreadable agent message");
                    }
                },
                Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
                Err(_) => {
                    info!(tenant_id = %reader_tenant, "agent websocket idle timeout, closing");
                    break;
                }
            }
        }
    });

    // Task: heartbeat
    let sender = Arc::clone(&ws_sender);
    let interval = Duration::from_secs(state.remote.heartbeat_interval_secs.max(1));
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sender
                .lock()
                .await
                .send(Message::Ping(Vec::new().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let aborts = [
        forwarder.abort_handle(),
        reader.abort_handle(),
        heartbeat.abort_handle(),
    ];
    tokio::select! {
        _ = forwarder => {},
        _ = reader => {},
        _ = heartbeat => {},
    }
    for abort in aborts {
        abort.abort();
    }

    state.hub.on_disconnect(&tenant, conn);
    state.refresh_gauges();
    let _ = ws_sender.lock().await.close().await;
}
