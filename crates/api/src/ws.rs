//! WebSocket transport bridging sockets to the broadcast hub.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use opspulse_broadcast::{BroadcastHub, ClientFrame, Outbound};

use crate::app::AppState;

/// `GET /ws`: upgrade and hand the socket to the hub.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Per-connection loop: hub frames out, control frames in.
async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (session, mut outbound) = hub.attach();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Frame(frame)) => {
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Ping) => {
                        if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    // The hub reaped this session (overflow or heartbeat).
                    None => break,
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => hub.handle_frame(session, frame),
                            Err(_) => hub.reject_frame(
                                session,
                                "unrecognized message; expected subscribe, ping, pause, or resume",
                            ),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => hub.touch(session),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    hub.detach(session);
}
