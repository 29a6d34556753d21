// ABOUTME: Protocol module for the voxspace wire format
// ABOUTME: JSON message envelope and a small async client used by tools and tests

/// WebSocket client for the voice protocol
pub mod client;
/// Protocol message type definitions
pub mod messages;

pub use client::ProtocolClient;
pub use messages::Message;
