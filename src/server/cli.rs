// ABOUTME: CLI argument parsing and server builder utilities
// ABOUTME: Turns command-line flags into a ServerConfig and sets up tracing for the server binary

use crate::server::{LogLevel, ServerConfig, SpatialSettings, VoiceChannel};
use clap::Args;
use std::net::IpAddr;

/// Server arguments for the standalone binary
///
/// Use with `#[command(flatten)]` in a binary's Args struct:
/// ```ignore
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     server: ServerArgs,
/// }
/// ```
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value = "9987")]
    pub port: u16,

    /// WebSocket endpoint path
    #[arg(long, default_value = "/voice")]
    pub path: String,

    /// Voice server identity clients should join
    #[arg(long = "voice-server", default_value = "localhost")]
    pub voice_server: String,

    /// Voice channel id
    #[arg(long = "channel-id", default_value = "0")]
    pub channel_id: u64,

    /// Voice channel password
    #[arg(long = "channel-password", default_value = "")]
    pub channel_password: String,

    /// Audio tick interval in milliseconds
    #[arg(long, default_value = "50")]
    pub tick_ms: u64,

    /// Voice range of new clients
    #[arg(long, default_value = "20.0")]
    pub voice_range: f32,

    /// Distance factor of the attenuation curve
    #[arg(long, default_value = "0.01")]
    pub distance_factor: f32,

    /// Rolloff factor of the attenuation curve
    #[arg(long, default_value = "1.0")]
    pub rolloff_factor: f32,

    /// Maximum number of connected clients
    #[arg(long, default_value = "1024")]
    pub max_clients: usize,

    /// LogMessage threshold (0 none, 1 error, 2 warning, 3 info, 4 debug)
    #[arg(long, default_value = "3")]
    pub log_level: i32,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "voxspace=debug,voxspace_server=debug"
        } else {
            "voxspace=info,voxspace_server=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self) {
        tracing::info!("Voxspace Server v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Bind: {}:{}", self.host, self.port);
        tracing::info!("Endpoint: ws://{}:{}{}", self.host, self.port, self.path);
        tracing::info!(
            "Voice channel: {} on {}",
            self.channel_id,
            self.voice_server
        );
    }

    /// Build ServerConfig from these args
    pub fn build_config(&self) -> ServerConfig {
        let channel = VoiceChannel::new(
            self.voice_server.clone(),
            self.channel_id,
            self.channel_password.clone(),
        );

        ServerConfig::new(self.port, channel)
            .bind_host(self.host)
            .ws_path(self.path.clone())
            .tick_interval_ms(self.tick_ms)
            .default_voice_range(self.voice_range)
            .spatial(SpatialSettings {
                distance_factor: self.distance_factor,
                rolloff_factor: self.rolloff_factor,
            })
            .max_clients(self.max_clients)
            .log_level(LogLevel::from_i32(self.log_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        server: ServerArgs,
    }

    #[test]
    fn test_default_args() {
        let args = TestArgs::parse_from(["voxspace-server"]).server;

        assert_eq!(args.port, 9987);
        assert_eq!(args.path, "/voice");
        assert_eq!(args.tick_ms, 50);
        assert_eq!(args.log_level, 3);
        assert!(!args.verbose);
    }

    #[test]
    fn test_build_config() {
        let args = TestArgs::parse_from([
            "voxspace-server",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--voice-server",
            "abc",
            "--channel-id",
            "130",
            "--voice-range",
            "5",
            "--log-level",
            "9",
        ])
        .server;

        let config = args.build_config();
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.channel.server_id, "abc");
        assert_eq!(config.channel.channel_id, 130);
        assert_eq!(config.default_voice_range, 5.0);
        assert_eq!(config.log_level, LogLevel::Debug);
    }
}
