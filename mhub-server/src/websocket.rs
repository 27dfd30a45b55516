//! WebSocket transport (§4.10): one JSON document per frame.
//!
//! Grounded on the teacher's `connection.rs::handle_connection` — split
//! sender/receiver tasks over an `mpsc::unbounded_channel`, joined with
//! `tokio::select!` so either side finishing closes the other — generalized
//! from JSON-RPC request/response framing to decoding a [`Command`] per text
//! frame and forwarding every [`Response`] the attached [`HubClient`]
//! produces, including asynchronous subscription deliveries.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use mhub_core::codec;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::hub::Hub;
use crate::hub_client::HubClient;

/// Accepts connections on `listener` until the process shuts down, spawning
/// one task per connection. Never returns under normal operation.
pub async fn serve_websocket(listener: TcpListener, hub: Arc<Hub>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept websocket connection");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, hub).await {
                tracing::warn!(error = %e, peer = %peer, "websocket connection ended with an error");
            }
        });
    }
}

#[tracing::instrument(skip(stream, hub))]
async fn handle_connection(stream: TcpStream, hub: Arc<Hub>) -> mhub_core::error::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| mhub_core::error::Error::protocol(format!("websocket handshake failed: {e}")))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Arc::new(HubClient::new(hub, tx.clone()));

    let mut send_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let text = match codec::encode(&response) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode response");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let client_clone = client.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    let cmd = match codec::decode(&text) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            let _ = tx.send(mhub_core::types::Response::error(None, e.wire_message()));
                            continue;
                        }
                    };
                    if let Some(response) = client_clone.process_command(cmd).await {
                        let _ = tx.send(response);
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "websocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    client.close().await;
    Ok(())
}
