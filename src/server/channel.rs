// ABOUTME: Voice channel identity
// ABOUTME: Channel coordinates and the verifier seam consulted before the server starts

use crate::protocol::messages::ChannelInfo;

/// The external voice channel clients join
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoiceChannel {
    /// Identity of the voice server hosting the channel
    pub server_id: String,
    /// Channel identifier on that server
    pub channel_id: u64,
    /// Channel password
    pub password: String,
}

impl VoiceChannel {
    /// Create channel coordinates
    pub fn new(server_id: impl Into<String>, channel_id: u64, password: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            channel_id,
            password: password.into(),
        }
    }

    /// Wire form handed to clients that still need to join
    pub fn to_info(&self) -> ChannelInfo {
        ChannelInfo {
            server_id: self.server_id.clone(),
            channel_id: self.channel_id,
            password: self.password.clone(),
        }
    }
}

/// Checks that the voice channel is reachable before the server goes live
pub trait ChannelVerifier: Send + Sync {
    /// Return `Err` with a reason when clients could not join `channel`
    fn verify(&self, channel: &VoiceChannel) -> Result<(), String>;
}

/// Accepts any channel with a non-empty server id
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticChannelVerifier;

impl ChannelVerifier for StaticChannelVerifier {
    fn verify(&self, channel: &VoiceChannel) -> Result<(), String> {
        if channel.server_id.trim().is_empty() {
            return Err("voice server id is empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_verifier() {
        let verifier = StaticChannelVerifier;
        assert!(verifier.verify(&VoiceChannel::new("abc", 0, "")).is_ok());
        assert!(verifier.verify(&VoiceChannel::new("  ", 1, "pw")).is_err());
    }
}
