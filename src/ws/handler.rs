//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::GameError;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::gateway::{error_reply, Connection, Gateway};
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut conn = Connection::new();
    info!(connection_id = %conn.id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        connection_id: conn.id.0,
        server_time: unix_millis(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(connection_id = %conn.id, error = %e, "Failed to send welcome");
        return;
    }

    run_session(&state.gateway, &mut conn, ws_sink, ws_stream).await;

    // Cleanup on disconnect
    state.gateway.disconnect(&mut conn).await;

    info!(connection_id = %conn.id, "WebSocket connection closed");
}

/// Pump inbound events to the gateway and game updates out to the socket
async fn run_session(
    gateway: &Gateway,
    conn: &mut Connection,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
) {
    let rate_limiter = ConnectionRateLimiter::new();
    let mut updates: Option<broadcast::Receiver<ServerMsg>> = None;

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                let Some(result) = inbound else {
                    break;
                };

                match result {
                    Ok(Message::Text(text)) => {
                        let reply = if !rate_limiter.check_input() {
                            warn!(connection_id = %conn.id, "Rate limited input message");
                            Some(error_reply(conn, &GameError::RateLimited))
                        } else {
                            match serde_json::from_str::<ClientMsg>(&text) {
                                Ok(msg) => dispatch(gateway, conn, msg, &mut updates).await,
                                Err(e) => {
                                    warn!(connection_id = %conn.id, error = %e, "Failed to parse client message");
                                    Some(error_reply(conn, &GameError::Validation(e.to_string())))
                                }
                            }
                        };

                        if let Some(reply) = reply {
                            if let Err(e) = send_msg(&mut ws_sink, &reply).await {
                                debug!(connection_id = %conn.id, error = %e, "WebSocket send failed");
                                break;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        warn!(connection_id = %conn.id, "Received binary message, ignoring");
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => {
                        info!(connection_id = %conn.id, "Client initiated close");
                        break;
                    }
                    Err(e) => {
                        error!(connection_id = %conn.id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            update = next_update(&mut updates) => {
                match update {
                    Ok(msg) => {
                        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                            debug!(connection_id = %conn.id, error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Every update is a full snapshot, the next one resynchronizes
                        warn!(connection_id = %conn.id, lagged_count = n, "Client lagged, skipped updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(connection_id = %conn.id, "Update channel closed");
                        updates = None;
                    }
                }
            }
        }
    }
}

/// Route one client message. Returns a reply for this connection only.
async fn dispatch(
    gateway: &Gateway,
    conn: &mut Connection,
    msg: ClientMsg,
    updates: &mut Option<broadcast::Receiver<ServerMsg>>,
) -> Option<ServerMsg> {
    match msg {
        ClientMsg::Join { game_id, player } => match gateway.join(conn, game_id, player).await {
            Ok(rx) => {
                *updates = Some(rx);
                None
            }
            // The previous binding and its update stream are kept
            Err(e) => Some(error_reply(conn, &e)),
        },
        ClientMsg::Move {
            game_id,
            from,
            to,
            piece,
        } => match gateway.make_move(conn, game_id, from, to, piece).await {
            // The snapshot reaches this connection through the update stream
            Ok(_) => None,
            Err(e) => Some(error_reply(conn, &e)),
        },
        ClientMsg::Ping { t } => Some(ServerMsg::Pong { t }),
    }
}

/// Next game update, or never when the connection has not joined a game
async fn next_update(
    updates: &mut Option<broadcast::Receiver<ServerMsg>>,
) -> Result<ServerMsg, broadcast::error::RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
