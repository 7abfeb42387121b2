//! Outbound dialling of configured neighbour servers.
//!
//! One task per neighbour: dial, greet with `server_hello` +
//! `client_list_request`, relay frames between the socket and the node,
//! and on any failure retry with bounded exponential backoff. Inbound
//! neighbour connections are never redialled from this side.

use crate::error::Result;
use crate::server::node::ServerNode;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Initial retry delay in seconds.
pub const BACKOFF_BASE_SECS: u64 = 1;

/// Retry delay ceiling in seconds.
pub const BACKOFF_MAX_SECS: u64 = 30;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawn one dial task per configured neighbour.
///
/// A neighbour entry equal to our own address is skipped, so every node in
/// a deployment can ship the identical neighbourhood list.
pub fn spawn(node: Arc<ServerNode>) {
    let own = node.address();
    for peer in node.config().neighbours.clone() {
        if peer == own {
            continue;
        }
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            dial_loop(node, peer).await;
        });
    }
}

async fn dial_loop(node: Arc<ServerNode>, peer: String) {
    let mut backoff = BACKOFF_BASE_SECS;
    loop {
        match connect_async(format!("ws://{}/", peer)).await {
            Ok((stream, _response)) => {
                backoff = BACKOFF_BASE_SECS;
                info!(peer = %peer, "connected to neighbour");
                if let Err(e) = run_session(&node, &peer, stream).await {
                    warn!(peer = %peer, error = %e, "neighbour session ended");
                } else {
                    info!(peer = %peer, "neighbour session closed");
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "dial failed");
            }
        }

        // Full jitter on top of the exponential step keeps a rebooted
        // neighbourhood from reconnecting in lockstep.
        let jitter_ms = rand::rngs::OsRng.gen_range(0..=backoff * 250);
        tokio::time::sleep(Duration::from_secs(backoff) + Duration::from_millis(jitter_ms)).await;
        backoff = (backoff * 2).min(BACKOFF_MAX_SECS);
    }
}

async fn run_session(node: &Arc<ServerNode>, peer: &str, stream: WsStream) -> Result<()> {
    let (session, mut outbound) = node.register_server_peer(peer).await;
    let result = drive(node, session, stream, &mut outbound).await;
    node.handle_disconnect(session).await;
    result
}

async fn drive(
    node: &Arc<ServerNode>,
    session: crate::server::SessionId,
    stream: WsStream,
    outbound: &mut mpsc::Receiver<String>,
) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = stream.split();

    for frame in node.greeting_frames()? {
        ws_tx.send(Message::Text(frame)).await?;
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => ws_tx.send(Message::Text(frame)).await?,
                // The node dropped our queue: session closed from inside.
                None => return Ok(()),
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => node.handle_frame(session, &text).await,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(other)) => {
                    debug!(kind = ?other, "ignoring non-text frame from neighbour");
                }
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}
