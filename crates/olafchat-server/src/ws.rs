//! WebSocket endpoint: one session per connection, one message per frame.

use crate::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use olafchat_core::server::ServerNode;
use std::sync::Arc;
use tracing::debug;

/// Upgrade handler for `GET /`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let node = Arc::clone(&state.node);
    ws.max_message_size(olafchat_core::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_session(socket, node))
}

/// Drive one peer session: drain the node's outbound queue into the socket
/// and feed received text frames into the node. Parse errors stay inside
/// the node (drop-and-log); only transport failures end the session.
async fn handle_session(socket: WebSocket, node: Arc<ServerNode>) {
    let (session, mut outbound) = node.register_session().await;
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!(session, "peer attached");

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // The node closed the session from inside.
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => node.handle_frame(session, &text).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {
                    debug!(session, "ignoring non-text frame");
                }
                Some(Err(e)) => {
                    debug!(session, error = %e, "socket error");
                    break;
                }
            },
        }
    }

    node.handle_disconnect(session).await;
    let _ = ws_tx.close().await;
    debug!(session, "peer detached");
}
