use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::grid;
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::room::{Room, RoomConnection};

use super::AppState;

/// How long a fresh connection may idle before sending its `auth`.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the per-connection outbound queue. A client that falls this far
/// behind is dropped rather than buffered without limit.
pub const OUTBOUND_QUEUE_WATERMARK: usize = 256;

pub(super) async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    state.metrics.increment_connections_accepted();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Arc<ServerMessage>>(OUTBOUND_QUEUE_WATERMARK);
    let cancel = CancellationToken::new();
    let send_task = tokio::spawn(send_loop(sink, rx, cancel.clone()));

    // Capacity gate runs before anything else, so a rejected client never
    // even sees an auth challenge.
    if state.manager.total_player_count() >= state.max_players {
        state.metrics.increment_connections_rejected_capacity();
        tracing::info!(client_addr = %addr, "Rejecting connection, node at capacity");
        send_error(&tx, ErrorCode::Capacity);
        drop(tx);
        let _ = send_task.await;
        return;
    }

    let conn_id = Uuid::new_v4();
    tracing::debug!(%conn_id, client_addr = %addr, "WebSocket connection established");

    let routed = pending_phase(&state, &mut stream, &tx, &cancel, conn_id).await;

    let Some(room) = routed else {
        drop(tx);
        let _ = send_task.await;
        return;
    };

    // Routed: every further frame belongs to the room's state machine.
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => {
                let Some(Ok(message)) = frame else { break };
                match message {
                    Message::Text(text) => {
                        // Malformed frames are dropped without comment.
                        if let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) {
                            room.handle_message(conn_id, parsed);
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    tracing::debug!(%conn_id, map_id = room.map_id(), "WebSocket connection closed");
    room.handle_disconnect(conn_id);
    cancel.cancel();
    drop(tx);
    let _ = send_task.await;
}

/// Waits for the first meaningful message and routes the connection into a
/// room. `None` means the connection is done (timeout, error or close).
async fn pending_phase(
    state: &AppState,
    stream: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
    tx: &mpsc::Sender<Arc<ServerMessage>>,
    cancel: &CancellationToken,
    conn_id: Uuid,
) -> Option<Arc<Room>> {
    let pending = tokio::time::sleep(PENDING_TIMEOUT);
    tokio::pin!(pending);

    loop {
        tokio::select! {
            () = &mut pending => {
                state.metrics.increment_pending_timeouts();
                tracing::debug!(%conn_id, "No auth within pending window, closing");
                send_error(tx, ErrorCode::Timeout);
                return None;
            }
            () = cancel.cancelled() => return None,
            frame = stream.next() => {
                let Some(Ok(message)) = frame else { return None };
                let Message::Text(text) = message else {
                    if matches!(message, Message::Close(_)) {
                        return None;
                    }
                    continue;
                };
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        let _ = tx.try_send(Arc::new(ServerMessage::Pong));
                    }
                    Ok(ClientMessage::Auth { pubkey, map_id }) => {
                        if map_id >= u32::from(grid::MAP_COUNT) {
                            send_error(tx, ErrorCode::InvalidMap);
                            return None;
                        }
                        let map_id = map_id as u16;
                        if !state.manager.is_map_served(map_id) {
                            send_error(tx, ErrorCode::MapNotServed);
                            return None;
                        }
                        let conn = RoomConnection {
                            id: conn_id,
                            sender: tx.clone(),
                            cancel: cancel.clone(),
                        };
                        let Some(room) = state.manager.add_connection(conn, map_id) else {
                            send_error(tx, ErrorCode::JoinFailed);
                            return None;
                        };
                        // Replay the auth claim so the room's state machine
                        // issues the challenge.
                        room.handle_message(
                            conn_id,
                            ClientMessage::Auth {
                                pubkey,
                                map_id: u32::from(map_id),
                            },
                        );
                        return Some(room);
                    }
                    // Anything else before auth is ignored; the pending
                    // timer will close the transport.
                    Ok(_) | Err(_) => {}
                }
            }
        }
    }
}

async fn send_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<ServerMessage>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Queue drains ahead of cancellation so a final error frame
            // (REPLACED, CAPACITY) reaches the client before the close.
            biased;
            maybe = rx.recv() => {
                match maybe {
                    Some(message) => {
                        if send_json(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            () = cancel.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    if send_json(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(err) => {
            tracing::error!(error = %err, "Failed to serialize server message");
            Ok(())
        }
    }
}

fn send_error(tx: &mpsc::Sender<Arc<ServerMessage>>, code: ErrorCode) {
    let _ = tx.try_send(Arc::new(ServerMessage::Error {
        message: code.description().to_string(),
        code,
    }));
}
