//! /ws — real-time telemetry over WebSocket.
//!
//! Clients receive the frames pushed into the daemon's broadcast channel:
//! `transfer_progress` events from the engine's progress sink and periodic
//! `link_metrics` snapshots. Inbound messages are echoed as pongs so
//! dashboards can keep the connection alive.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;

use super::ApiState;

pub async fn handle_telemetry_ws(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> Response {
    ws.on_upgrade(move |socket| telemetry_session(socket, state))
}

async fn telemetry_session(mut socket: WebSocket, state: ApiState) {
    let mut feed = state.telemetry.subscribe();
    loop {
        tokio::select! {
            frame = feed.recv() => {
                match frame {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Skipped frames under lag are fine; telemetry is periodic.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let pong = serde_json::json!({ "type": "pong", "data": text.as_str() });
                        if socket.send(Message::Text(pong.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!("telemetry client disconnected");
}
