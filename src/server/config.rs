// ABOUTME: Server configuration
// ABOUTME: Defines configurable parameters for the voice server

use crate::server::channel::VoiceChannel;
use crate::server::events::LogLevel;
use crate::server::spatial::SpatialSettings;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind the listener to
    pub bind_host: IpAddr,
    /// Listening port (0 picks an ephemeral port)
    pub port: u16,
    /// WebSocket endpoint path
    pub ws_path: String,
    /// Voice channel clients authenticate into
    pub channel: VoiceChannel,
    /// Audio tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// How long a new connection may take to send its handshake
    pub handshake_timeout_ms: u64,
    /// Maximum number of simultaneously connected clients
    pub max_clients: usize,
    /// Voice range given to new clients
    pub default_voice_range: f32,
    /// Initial attenuation curve
    pub spatial: SpatialSettings,
    /// Initial LogMessage threshold
    pub log_level: LogLevel,
    /// Whether `stop()` removes clients without Disconnected events
    pub silent_bulk_removal: bool,
    /// Worker threads of the server's runtime
    pub worker_threads: usize,
}

impl ServerConfig {
    /// Create a configuration for `port` and `channel` with defaults elsewhere
    pub fn new(port: u16, channel: VoiceChannel) -> Self {
        Self {
            port,
            channel,
            ..Default::default()
        }
    }

    /// Set the bind host
    pub fn bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    /// Set the WebSocket path
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set the audio tick interval in milliseconds
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    /// Set the handshake timeout in milliseconds
    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    /// Set the client limit
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Set the voice range of new clients
    pub fn default_voice_range(mut self, range: f32) -> Self {
        self.default_voice_range = range;
        self
    }

    /// Set the initial attenuation curve
    pub fn spatial(mut self, settings: SpatialSettings) -> Self {
        self.spatial = settings;
        self
    }

    /// Set the initial LogMessage threshold
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Choose whether `stop()` fires Disconnected for each removed client
    pub fn silent_bulk_removal(mut self, silent: bool) -> Self {
        self.silent_bulk_removal = silent;
        self
    }

    /// Set the runtime worker thread count
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Address the listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9987,
            ws_path: "/voice".to_string(),
            channel: VoiceChannel::default(),
            tick_interval_ms: 50,
            handshake_timeout_ms: 10_000,
            max_clients: 1024,
            default_voice_range: 20.0,
            spatial: SpatialSettings::default(),
            log_level: LogLevel::Info,
            silent_bulk_removal: true,
            worker_threads: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ServerConfig::new(4000, VoiceChannel::new("abc", 130, "pw"))
            .bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .tick_interval_ms(10)
            .max_clients(4)
            .worker_threads(0);

        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:4000");
        assert_eq!(config.channel.channel_id, 130);
        assert_eq!(config.tick_interval_ms, 10);
        assert_eq!(config.max_clients, 4);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.ws_path, "/voice");
    }
}
