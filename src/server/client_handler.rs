// ABOUTME: WebSocket client handler
// ABOUTME: Handles individual client connections, handshake, admission and status routing

use crate::error::Error;
use crate::protocol::messages::{
    ClientHandshake, Message, ServerHandshake, STATUS_CODE_INVALID_HANDSHAKE, STATUS_CODE_OK,
    STATUS_CODE_REJECTED, STATUS_CODE_SERVER_FULL,
};
use crate::server::engine::Engine;
use crate::server::events::{ConnectionRequest, LogLevel};
use crate::server::registry::{Handle, ServerMessage};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle a WebSocket client connection
pub async fn handle_client(
    socket: WebSocket,
    peer_addr: SocketAddr,
    engine: Arc<Engine>,
    handshake_timeout: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Wait for client/handshake
    let hello = match wait_for_handshake(&mut ws_rx, handshake_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            engine.events().log(
                LogLevel::Debug,
                format!("[{}] Handshake failed: {}", peer_addr, e),
            );
            let _ = reply(&mut ws_tx, refusal(STATUS_CODE_INVALID_HANDSHAKE, &e.to_string())).await;
            let _ = ws_tx.close().await;
            return;
        }
    };

    if hello.status_code != STATUS_CODE_OK {
        engine.events().log(
            LogLevel::Info,
            format!(
                "[{}] Handshake error: status {}",
                peer_addr, hello.status_code
            ),
        );
        let _ = reply(&mut ws_tx, refusal(STATUS_CODE_INVALID_HANDSHAKE, "client reported an error")).await;
        let _ = ws_tx.close().await;
        return;
    }

    // Create channel for server->client messages
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let request = ConnectionRequest {
        peer_addr: Some(peer_addr),
        voice_client_id: hello.voice_client_id,
        game_version: hello.game_version.clone(),
    };

    let handle = match engine.admit(request, tx) {
        Ok(handle) => handle,
        Err(e) => {
            let status = match e {
                Error::ResourceExhausted => STATUS_CODE_SERVER_FULL,
                _ => STATUS_CODE_REJECTED,
            };
            let _ = reply(&mut ws_tx, refusal(status, &e.to_string())).await;
            let _ = ws_tx.close().await;
            return;
        }
    };

    // Clients outside the voice channel are told where to go.
    let accepted = Message::ServerHandshake(ServerHandshake {
        status_code: STATUS_CODE_OK,
        reason: "OK".to_string(),
        handle: Some(handle),
        channel: (hello.voice_client_id == 0).then(|| engine.channel().to_info()),
    });
    if let Err(e) = reply(&mut ws_tx, accepted).await {
        log::warn!("[{}] Failed to send server/handshake: {}", peer_addr, e);
        engine.release(handle);
        return;
    }

    // Spawn task to forward server messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let ws_msg = match msg {
                ServerMessage::Text(text) => WsMessage::Text(text.into()),
                ServerMessage::Close => {
                    let _ = ws_tx.close().await;
                    break;
                }
            };
            if ws_tx.send(ws_msg).await.is_err() {
                log::debug!("Client {} disconnected (send failed)", handle);
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if !handle_text_message(text.as_str(), handle, &engine) {
                    break;
                }
            }
            Ok(WsMessage::Binary(data)) => {
                log::debug!(
                    "Received binary from client {} ({} bytes)",
                    handle,
                    data.len()
                );
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                // Handled automatically by axum
            }
            Ok(WsMessage::Close(_)) => {
                log::info!("Client {} closed connection", handle);
                break;
            }
            Err(e) => {
                log::warn!("WebSocket error for client {}: {}", handle, e);
                break;
            }
        }
    }

    // Cleanup; a no-op when the host already removed the client
    engine.release(handle);
    send_task.abort();
}

/// Wait for client/handshake message
async fn wait_for_handshake(
    ws_rx: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> crate::Result<ClientHandshake> {
    let wait = tokio::time::timeout(timeout, async {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    return match Message::from_json(text.as_str())? {
                        Message::ClientHandshake(hello) => Ok(hello),
                        other => Err(Error::Protocol(format!(
                            "Expected client/handshake, got {:?}",
                            other
                        ))),
                    };
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                Ok(WsMessage::Close(_)) => {
                    return Err(Error::Connection(
                        "Connection closed before handshake".to_string(),
                    ));
                }
                Err(e) => return Err(Error::WebSocket(e.to_string())),
                _ => continue,
            }
        }
        Err(Error::Connection("Connection closed".to_string()))
    });

    match wait.await {
        Ok(result) => result,
        Err(_) => Err(Error::Connection(
            "Timeout waiting for client/handshake".to_string(),
        )),
    }
}

/// Handle incoming text message from client; false ends the session
fn handle_text_message(text: &str, handle: Handle, engine: &Engine) -> bool {
    let msg = match Message::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            engine.events().log(
                LogLevel::Warning,
                format!("Failed to parse message from client {}: {}", handle, e),
            );
            return true;
        }
    };

    match msg {
        Message::ClientStatus(status) => {
            if engine.update_status(handle, &status).is_err() {
                // Removed by the host while the report was in flight.
                return false;
            }
        }
        Message::ClientGoodbye(goodbye) => {
            log::info!(
                "Client {} sent goodbye with reason: {}",
                handle,
                goodbye.reason
            );
            return false;
        }
        other => {
            log::debug!("Unhandled message from client {}: {:?}", handle, other);
        }
    }
    true
}

fn refusal(status_code: u16, reason: &str) -> Message {
    Message::ServerHandshake(ServerHandshake {
        status_code,
        reason: reason.to_string(),
        handle: None,
        channel: None,
    })
}

async fn reply(ws_tx: &mut SplitSink<WebSocket, WsMessage>, msg: Message) -> crate::Result<()> {
    let json = msg.to_json()?;
    ws_tx
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))
}
