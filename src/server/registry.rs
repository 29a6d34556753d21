// ABOUTME: Client registry
// ABOUTME: Canonical set of connected clients with smallest-free handle allocation

use crate::server::spatial::Position;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Small positive integer naming a connected client
pub type Handle = u16;

/// Message types that can be sent to a client's transport task
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// JSON text message
    Text(String),
    /// Close the connection (forced removal)
    Close,
}

/// Status reported by the client's voice software
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceStatus {
    /// Voice activity detected
    pub talking: bool,
    /// Microphone muted in the voice client
    pub microphone_muted: bool,
    /// Speakers muted in the voice client
    pub speakers_muted: bool,
}

/// A connected game participant
#[derive(Debug)]
pub struct Client {
    /// Registry handle
    pub handle: Handle,
    /// Connection serial, unique for the table's lifetime even when handles are reused
    pub serial: u64,
    /// Identity inside the voice channel (0 until known)
    pub voice_client_id: u16,
    /// Display name set by the host
    pub nickname: String,
    /// Remote transport address, if any
    pub peer_addr: Option<SocketAddr>,
    /// Last world position
    pub position: Position,
    /// Maximum audible distance for this speaker
    pub voice_range: f32,
    /// Mirrors of the voice client's own status
    pub status: VoiceStatus,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Client {
    /// Create a client at the origin
    pub fn new(
        handle: Handle,
        voice_client_id: u16,
        peer_addr: Option<SocketAddr>,
        voice_range: f32,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            handle,
            serial: 0,
            voice_client_id,
            nickname: String::new(),
            peer_addr,
            position: Position::default(),
            voice_range,
            status: VoiceStatus::default(),
            tx,
        }
    }

    /// Send a message to this client's transport.
    ///
    /// Returns false once the transport is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// The set of connected clients, keyed by handle
///
/// Not synchronized on its own; the engine guards it together with the mute
/// and relative-position stores behind one lock.
#[derive(Debug)]
pub struct ClientTable {
    clients: BTreeMap<Handle, Client>,
    max_clients: usize,
    next_serial: u64,
}

impl ClientTable {
    /// Create an empty table accepting at most `max_clients` clients
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            max_clients: max_clients.min(usize::from(Handle::MAX)),
            next_serial: 1,
        }
    }

    /// Smallest handle not held by a connected client, if a slot is free
    pub fn next_free_handle(&self) -> Option<Handle> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        // Keys are sorted: the first gap in 1, 2, 3, ... is the answer.
        let mut candidate: Handle = 1;
        for &handle in self.clients.keys() {
            if handle != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        Some(candidate)
    }

    /// Insert a client built for `next_free_handle()`, stamping a fresh serial
    pub fn insert(&mut self, mut client: Client) -> u64 {
        client.serial = self.next_serial;
        self.next_serial += 1;
        let serial = client.serial;
        self.clients.insert(client.handle, client);
        serial
    }

    /// Remove a client, returning it
    pub fn remove(&mut self, handle: Handle) -> Option<Client> {
        self.clients.remove(&handle)
    }

    /// Remove every client
    pub fn drain(&mut self) -> Vec<Client> {
        std::mem::take(&mut self.clients).into_values().collect()
    }

    /// Look up a client
    pub fn get(&self, handle: Handle) -> Option<&Client> {
        self.clients.get(&handle)
    }

    /// Look up a client mutably
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Client> {
        self.clients.get_mut(&handle)
    }

    /// Whether `handle` names a connected client
    pub fn contains(&self, handle: Handle) -> bool {
        self.clients.contains_key(&handle)
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Up to `max_count` handles in ascending order; the rest are omitted
    pub fn handles(&self, max_count: usize) -> Vec<Handle> {
        self.clients.keys().copied().take(max_count).collect()
    }

    /// Iterate over all clients in handle order
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(table: &ClientTable) -> (Client, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = table.next_free_handle().expect("slot available");
        (Client::new(handle, 0, None, 20.0, tx), rx)
    }

    #[test]
    fn test_handles_start_at_one() {
        let table = ClientTable::new(8);
        assert_eq!(table.next_free_handle(), Some(1));
    }

    #[test]
    fn test_smallest_free_handle_is_reused() {
        let mut table = ClientTable::new(8);
        for _ in 0..4 {
            let (c, _rx) = client(&table);
            table.insert(c);
        }
        assert_eq!(table.handles(10), vec![1, 2, 3, 4]);

        table.remove(2);
        table.remove(3);
        assert_eq!(table.next_free_handle(), Some(2));

        let (c, _rx) = client(&table);
        table.insert(c);
        assert_eq!(table.next_free_handle(), Some(3));
    }

    #[test]
    fn test_reused_handle_gets_new_serial() {
        let mut table = ClientTable::new(8);
        let (c, _rx) = client(&table);
        let first = table.insert(c);
        table.remove(1);

        let (c, _rx) = client(&table);
        let second = table.insert(c);
        assert_eq!(table.get(1).map(|c| c.serial), Some(second));
        assert!(second > first);
    }

    #[test]
    fn test_capacity_limit() {
        let mut table = ClientTable::new(2);
        for _ in 0..2 {
            let (c, _rx) = client(&table);
            table.insert(c);
        }
        assert_eq!(table.next_free_handle(), None);

        table.remove(1);
        assert_eq!(table.next_free_handle(), Some(1));
    }

    #[test]
    fn test_handles_truncates() {
        let mut table = ClientTable::new(8);
        for _ in 0..5 {
            let (c, _rx) = client(&table);
            table.insert(c);
        }
        assert_eq!(table.handles(3), vec![1, 2, 3]);
        assert_eq!(table.handles(0), Vec::<Handle>::new());
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = ClientTable::new(8);
        let (c, _rx) = client(&table);
        table.insert(c);

        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert!(table.is_empty());
        assert_eq!(table.next_free_handle(), Some(1));
    }

    #[test]
    fn test_send_fails_after_transport_gone() {
        let table = ClientTable::new(8);
        let (c, rx) = client(&table);
        assert!(c.send(ServerMessage::Close));
        drop(rx);
        assert!(!c.send(ServerMessage::Close));
    }
}
