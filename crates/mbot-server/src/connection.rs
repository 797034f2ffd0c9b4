//! The per-client connection loop.
//!
//! Each connection is split in two.  A writer task owns the socket's sink
//! and drains the connection's outbox, which both the bridge (subscription
//! pushes) and the read loop (replies) feed.  The read loop hands every
//! frame to the bridge exactly once; a malformed frame earns an ERROR reply
//! and the loop carries on.  Close, a transport error or shutdown ends the
//! loop and the connection's subscriptions with it.
//!
//! A client that stops reading eventually blocks its writer on a full TCP
//! buffer.  The writer gets [`CLOSE_GRACE`] to flush once the loop ends and
//! is aborted after that, so one stalled client cannot hold up shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mbot_middleware::BridgeHandle;
use mbot_types::{BridgeError, ConnectionId, Envelope};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Frames a client may have queued before pushes to it are dropped.
pub const OUTBOX_CAPACITY: usize = 64;

/// How long the writer may keep flushing after the read loop has ended.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Serve one client until it goes away or `shutdown` fires.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] when the WebSocket handshake or a
/// later read fails.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: BridgeHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BridgeError::Transport(format!("ws handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let conn = ConnectionId::new();
    let (outbox, mut pending) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    bridge.connect(conn, outbox.clone()).await?;
    info!(conn = %conn, peer = %peer, "client connected");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = pending.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        // Every sender is gone: the bridge shut down or the reader stopped.
        let _ = ws_tx.close().await;
    });

    let result = loop {
        if *shutdown.borrow_and_update() {
            break Ok(());
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    // Invalid UTF-8 still reaches the bridge, which rejects it as JSON.
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        break Err(BridgeError::Transport(format!("ws read from {peer}: {e}")));
                    }
                };
                match bridge.dispatch(conn, text).await {
                    Ok(Some(reply)) => {
                        tokio::select! {
                            sent = send_reply(&outbox, reply) => {
                                if let Err(e) = sent {
                                    break Err(e);
                                }
                            }
                            // The outbox stays full while the client is not reading.
                            _ = shutdown.changed() => break Ok(()),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => break Err(e),
                }
            }
        }
    };

    bridge.disconnect(conn).await;
    drop(outbox);
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        warn!(conn = %conn, peer = %peer, "client is not reading, dropping it without a close frame");
        writer.abort();
    }
    debug!(conn = %conn, peer = %peer, "client connection closed");
    result
}

async fn send_reply(outbox: &mpsc::Sender<String>, reply: Envelope) -> Result<(), BridgeError> {
    let frame = reply.encode()?;
    outbox
        .send(frame)
        .await
        .map_err(|_| BridgeError::Transport("client writer has stopped".to_string()))
}
