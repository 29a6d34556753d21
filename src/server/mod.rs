// ABOUTME: Server module for the positional voice engine
// ABOUTME: Provides the client registry, spatial model, mutes, events, WebSocket transport and lifecycle

mod audio_engine;
mod channel;
pub mod cli;
mod client_handler;
mod config;
mod engine;
mod events;
mod mute;
mod registry;
mod server;
mod spatial;

pub use audio_engine::{spawn_audio_engine, AudioEngine};
pub use channel::{ChannelVerifier, StaticChannelVerifier, VoiceChannel};
pub use cli::ServerArgs;
pub use client_handler::handle_client;
pub use config::ServerConfig;
pub use engine::{Audible, Engine, ListenerMix};
pub use events::{ConnectionRequest, EventDispatcher, EventKind, LogLevel, RejectReason, ServerEvent};
pub use mute::MuteStore;
pub use registry::{Client, ClientTable, Handle, ServerMessage, VoiceStatus};
pub use server::{LifecycleState, VoiceServer};
pub use spatial::{attenuation, world_offset, ClientPosition, Position, RelativePositions, SpatialSettings, Vec3};
