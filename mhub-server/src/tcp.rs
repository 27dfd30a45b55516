//! Newline-delimited TCP transport (§4.10): one JSON document per line,
//! tolerant of CRLF line endings and blank lines, with partial lines
//! buffered across reads.
//!
//! Grounded on the teacher's `connection.rs::handle_connection` split
//! sender/receiver task shape, adapted from `tokio-tungstenite` framing to
//! plain `tokio::io::{BufReader, AsyncBufReadExt}` line reads, per a parallel
//! framing rather than a WebSocket one.

use std::sync::Arc;

use mhub_core::codec;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::hub::Hub;
use crate::hub_client::HubClient;

/// Accepts connections on `listener` until the process shuts down, spawning
/// one task per connection. Never returns under normal operation.
pub async fn serve_tcp(listener: TcpListener, hub: Arc<Hub>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept tcp connection");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, hub).await {
                tracing::warn!(error = %e, peer = %peer, "tcp connection ended with an error");
            }
        });
    }
}

#[tracing::instrument(skip(stream, hub))]
async fn handle_connection(stream: TcpStream, hub: Arc<Hub>) -> mhub_core::error::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half);

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
            if write_half.write_all(text.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let client_clone = client.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match lines.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    let cmd = match codec::decode(trimmed) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            let _ = tx.send(mhub_core::types::Response::error(None, e.wire_message()));
                            break;
                        }
                    };
                    if let Some(response) = client_clone.process_command(cmd).await {
                        let _ = tx.send(response);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "tcp read error");
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
