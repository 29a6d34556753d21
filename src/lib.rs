// ABOUTME: Main library entry point for voxspace
// ABOUTME: Exports the positional voice server engine and its wire protocol

//! # voxspace
//!
//! Server engine for positional voice chat in multiplayer games.
//!
//! A game host creates a [`VoiceServer`], registers observers for the events it
//! cares about and feeds player positions every frame. Game clients connect over
//! a WebSocket, are admitted through the Connecting observer and receive, on a
//! fixed tick, the set of other players they can hear together with the
//! attenuated volume and listener-relative position of each.
//!
//! ## Example: Running a Server
//!
//! ```no_run
//! use voxspace::server::{ServerConfig, VoiceChannel, VoiceServer};
//!
//! let server = VoiceServer::new();
//! server.register_client_connected(|handle| println!("client {handle} joined"));
//! server
//!     .create(ServerConfig::new(9987, VoiceChannel::new("abc", 130, "secret")))
//!     .unwrap();
//! server.start().unwrap();
//!
//! server.set_client_position(1, 10.0, 4.0, 0.0, 0.0).ok();
//! ```

#![warn(missing_docs)]

/// Wire protocol spoken between game clients and the server
pub mod protocol;
/// Server engine: registry, spatial model, mutes, events and lifecycle
pub mod server;

pub use server::{Handle, ServerConfig, ServerEvent, VoiceServer};

/// Result type for voxspace operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for voxspace
pub mod error {
    use crate::server::Handle;
    use thiserror::Error;

    /// Error types for voxspace operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// The handle does not name a connected client
        #[error("client {0} not found")]
        NotFound(Handle),

        /// Operation attempted outside the lifecycle state it requires
        #[error("cannot {operation} while server is {state}")]
        InvalidState {
            /// Operation that was refused
            operation: &'static str,
            /// Lifecycle state at the time of the call
            state: &'static str,
        },

        /// No handle is left for a new client
        #[error("no client slots available")]
        ResourceExhausted,

        /// Connection declined by the Connecting observer
        #[error("connection rejected")]
        Rejected,

        /// Caller supplied a value the engine cannot use
        #[error("invalid argument: {0}")]
        InvalidArgument(String),

        /// Voice channel identity could not be verified
        #[error("voice channel error: {0}")]
        Channel(String),

        /// I/O error (binding, sockets)
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        /// Protocol violation or parsing error
        #[error("Protocol error: {0}")]
        Protocol(String),

        /// WebSocket-related error
        #[error("WebSocket error: {0}")]
        WebSocket(String),

        /// Connection-related error
        #[error("Connection error: {0}")]
        Connection(String),
    }
}
