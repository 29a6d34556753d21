// ABOUTME: WebSocket protocol client
// ABOUTME: Connects to a voxspace server, performs the handshake and exchanges status/update messages

use crate::error::Error;
use crate::protocol::messages::{
    ClientGoodbye, ClientHandshake, ClientStatus, Message, ServerHandshake, STATUS_CODE_OK,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Game-side connection to a voice server
///
/// Used by the integration tests and by hosts that want to script clients.
pub struct ProtocolClient {
    ws: WsStream,
    handshake: ServerHandshake,
}

impl ProtocolClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9987/voice`) and perform the handshake.
    ///
    /// Returns the client even when the server refused the handshake; inspect
    /// [`ProtocolClient::handshake`] or [`ProtocolClient::is_accepted`].
    pub async fn connect(url: &str, hello: ClientHandshake) -> crate::Result<Self> {
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let json = Message::ClientHandshake(hello).to_json()?;
        ws.send(WsMessage::Text(json))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let handshake = loop {
            match Self::next_message(&mut ws).await? {
                Some(Message::ServerHandshake(handshake)) => break handshake,
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "Expected server/handshake, got {:?}",
                        other
                    )));
                }
                None => {
                    return Err(Error::Connection(
                        "Connection closed before handshake".to_string(),
                    ));
                }
            }
        };

        Ok(Self { ws, handshake })
    }

    /// The server's handshake answer
    pub fn handshake(&self) -> &ServerHandshake {
        &self.handshake
    }

    /// Whether the server admitted this client
    pub fn is_accepted(&self) -> bool {
        self.handshake.status_code == STATUS_CODE_OK
    }

    /// Assigned handle, if admitted
    pub fn handle(&self) -> Option<u16> {
        self.handshake.handle
    }

    /// Report voice client status
    pub async fn send_status(&mut self, status: ClientStatus) -> crate::Result<()> {
        self.send(Message::ClientStatus(status)).await
    }

    /// Send a protocol message
    pub async fn send(&mut self, msg: Message) -> crate::Result<()> {
        let json = msg.to_json()?;
        self.ws
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    /// Wait up to `timeout` for the next protocol message.
    ///
    /// `Ok(None)` means the server closed the connection.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> crate::Result<Option<Message>> {
        tokio::time::timeout(timeout, Self::next_message(&mut self.ws))
            .await
            .map_err(|_| Error::Connection("Timeout waiting for message".to_string()))?
    }

    /// Say goodbye and close the socket
    pub async fn disconnect(mut self, reason: &str) -> crate::Result<()> {
        self.send(Message::ClientGoodbye(ClientGoodbye {
            reason: reason.to_string(),
        }))
        .await?;
        self.ws
            .close(None)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn next_message(ws: &mut WsStream) -> crate::Result<Option<Message>> {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Message::from_json(&text).map(Some),
                Ok(WsMessage::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(e) => return Err(Error::WebSocket(e.to_string())),
            }
        }
        Ok(None)
    }
}
