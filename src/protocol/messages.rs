// ABOUTME: Protocol message type definitions and serialization
// ABOUTME: Supports client/handshake, client/status, server/update, etc.

use serde::{Deserialize, Serialize};

/// Handshake accepted / status report valid
pub const STATUS_CODE_OK: u16 = 0;
/// Connection declined by the host application
pub const STATUS_CODE_REJECTED: u16 = 1;
/// Every client slot is taken
pub const STATUS_CODE_SERVER_FULL: u16 = 2;
/// First frame was not a usable handshake
pub const STATUS_CODE_INVALID_HANDSHAKE: u16 = 3;

/// Top-level protocol message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// First message a client sends after connecting
    #[serde(rename = "client/handshake")]
    ClientHandshake(ClientHandshake),

    /// Server answer to a handshake
    #[serde(rename = "server/handshake")]
    ServerHandshake(ServerHandshake),

    /// Voice client status report (talking, mutes)
    #[serde(rename = "client/status")]
    ClientStatus(ClientStatus),

    /// Audible-set delta for one listener
    #[serde(rename = "server/update")]
    ServerUpdate(ServerUpdate),

    /// Display name assigned by the host
    #[serde(rename = "server/nickname")]
    ServerNickname(ServerNickname),

    /// Client goodbye message
    #[serde(rename = "client/goodbye")]
    ClientGoodbye(ClientGoodbye),
}

impl Message {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::error::Error::Protocol(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::error::Error::Protocol(e.to_string()))
    }
}

/// Client handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHandshake {
    /// Client-side result of its own startup checks
    pub status_code: u16,
    /// Game build the client runs
    #[serde(default)]
    pub game_version: String,
    /// Identity inside the voice channel, 0 if not joined yet
    #[serde(default)]
    pub voice_client_id: u16,
}

/// Server handshake response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHandshake {
    /// One of the `STATUS_CODE_*` constants
    pub status_code: u16,
    /// Human-readable reason
    pub reason: String,
    /// Handle assigned to the client (accepted handshakes only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<u16>,
    /// Voice channel to join (only sent to clients that are not in it yet)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelInfo>,
}

/// Voice channel coordinates handed to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Identity of the voice server hosting the channel
    pub server_id: String,
    /// Channel identifier
    pub channel_id: u64,
    /// Channel password
    pub password: String,
}

/// Client status message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    /// Voice activity detected
    pub talking: bool,
    /// Microphone muted in the voice client
    pub microphone_muted: bool,
    /// Speakers muted in the voice client
    pub speakers_muted: bool,
    /// Voice identity, reported once the client joined the channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_client_id: Option<u16>,
}

/// Server update message (server -> one listener)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUpdate {
    /// Changed speakers for this listener
    pub volumes: Vec<VolumeUpdate>,
}

/// Audibility of one speaker for the receiving listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    /// Voice identity of the speaker
    pub voice_client_id: u16,
    /// Game handle of the speaker
    pub handle: u16,
    /// True when the speaker became inaudible
    pub muted: bool,
    /// Attenuated volume in `0.0..=1.0`
    pub volume: f32,
    /// Speaker offset in the listener's frame
    pub position: [f32; 3],
}

/// Nickname assignment (server -> client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNickname {
    /// New display name
    pub nickname: String,
}

/// Client goodbye message (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGoodbye {
    /// Reason for disconnect
    pub reason: String,
}
