//! Dashboard websocket endpoint: forwards the printer manager's event
//! broadcast to connected clients as JSON, so a UI can show live state
//! without polling `/api/printers`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use crate::mqtt::PrinterEvent;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.printer_manager.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let payload = to_json(&event);
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Ignore anything a client sends; this is a read-only feed.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn to_json(event: &PrinterEvent) -> serde_json::Value {
    match event {
        PrinterEvent::Connected { serial } => json!({"type": "connected", "serial": serial}),
        PrinterEvent::Disconnected { serial } => json!({"type": "disconnected", "serial": serial}),
        PrinterEvent::FullSync { serial } => json!({"type": "full_sync", "serial": serial}),
        PrinterEvent::StateUpdate { serial, state } => json!({
            "type": "state",
            "serial": serial,
            "state": {
                "gcode_state": state.gcode_state,
                "mc_percent": state.mc_percent,
                "layer_num": state.layer_num,
                "total_layer_num": state.total_layer_num,
                "subtask_name": state.subtask_name,
            }
        }),
        PrinterEvent::VersionUpdate { serial, version } => json!({
            "type": "version",
            "serial": serial,
            "model": version.model.name(),
        }),
        PrinterEvent::RediscoveryNeeded { serial } => {
            json!({"type": "rediscovery_needed", "serial": serial})
        }
        PrinterEvent::Lifecycle { serial, event } => json!({
            "type": "lifecycle",
            "serial": serial,
            "event": event,
        }),
        PrinterEvent::Error { serial, message } => {
            json!({"type": "error", "serial": serial, "message": message})
        }
    }
}
