//! Host wiring between WebSocket connections and sessions.
//!
//! Deliberately thin: accept a connection, derive the client identity from
//! the peer address, create a channel pair, and pump frames between the
//! socket and the session. The session never sees WebSocket types.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::Authenticator;
use crate::channel::{self, ChannelOutput};
use crate::client_id::ClientId;
use crate::session::Session;

/// Inbound frame queue depth per connection. Outbound is unbounded (sends
/// are fire-and-forget from the session).
const INBOUND_QUEUE: usize = 256;

/// Accept connections forever, one session task per client.
pub async fn serve(addr: &str, auth: Arc<Authenticator>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    log::info!("listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        let auth = Arc::clone(&auth);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, auth).await {
                log::warn!("connection from {peer} ended with error: {e:#}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    auth: Arc<Authenticator>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake")?;

    // Identity from the peer IP only: hourly limits span reconnects.
    let client_id = ClientId::from_network_id(&peer.ip().to_string());
    log::info!("[{client_id}] connected from {peer}");

    let (session_channel, mut remote) = channel::pair(INBOUND_QUEUE);
    let session = tokio::spawn(Session::run(client_id, session_channel, auth));

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !remote.send_text(text).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !remote.send_binary(data).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    remote.disconnect();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("websocket error from {peer}: {e}");
                    remote.disconnect();
                    break;
                }
            },

            outbound = remote.next_output() => match outbound {
                Some(ChannelOutput::Frame(text)) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        remote.disconnect();
                        break;
                    }
                }
                Some(ChannelOutput::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    remote.disconnect();
                    break;
                }
                // Session finished shutting down.
                None => break,
            },
        }
    }

    // Let the session's shutdown flush finish before tearing down.
    let _ = session.await;
    Ok(())
}
