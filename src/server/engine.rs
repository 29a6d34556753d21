// ABOUTME: Engine core shared by the transport, the audio tick and the host API
// ABOUTME: One reader/writer lock over registry, mutes and overrides; events queued under that lock

use crate::error::Error;
use crate::protocol::messages::{ClientStatus, Message, ServerNickname};
use crate::server::channel::VoiceChannel;
use crate::server::events::{ConnectionRequest, EventDispatcher, LogLevel, RejectReason, ServerEvent};
use crate::server::mute::MuteStore;
use crate::server::registry::{Client, ClientTable, Handle, ServerMessage, VoiceStatus};
use crate::server::spatial::{attenuation, ClientPosition, Position, RelativePositions, SpatialSettings, Vec3};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything mutated by control calls and read by the audio tick
#[derive(Debug)]
struct ClientState {
    clients: ClientTable,
    mutes: MuteStore,
    relative: RelativePositions,
}

impl ClientState {
    fn require(&self, handle: Handle) -> crate::Result<&Client> {
        self.clients.get(handle).ok_or(Error::NotFound(handle))
    }

    fn require_mut(&mut self, handle: Handle) -> crate::Result<&mut Client> {
        self.clients.get_mut(handle).ok_or(Error::NotFound(handle))
    }

    fn forget(&mut self, handle: Handle) -> Option<Client> {
        let client = self.clients.remove(handle)?;
        self.mutes.purge(handle);
        self.relative.purge(handle);
        Some(client)
    }

    fn volume(&self, settings: &SpatialSettings, listener: &Client, speaker: &Client) -> (f32, Vec3) {
        let offset = self.relative.effective_offset(
            listener.handle,
            &listener.position,
            speaker.handle,
            &speaker.position,
        );
        if listener.handle == speaker.handle || self.mutes.blocks(speaker.handle, listener.handle) {
            return (0.0, offset);
        }
        (attenuation(settings, offset.length(), speaker.voice_range), offset)
    }
}

/// A speaker audible to one listener on this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Audible {
    /// Speaker handle
    pub handle: Handle,
    /// Speaker's connection serial
    pub serial: u64,
    /// Speaker's voice identity
    pub voice_client_id: u16,
    /// Attenuated volume, strictly positive
    pub volume: f32,
    /// Speaker offset in the listener's frame
    pub offset: Vec3,
}

/// Result of one audio tick for one listener
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerMix {
    /// Listener handle
    pub listener: Handle,
    /// Listener's connection serial
    pub serial: u64,
    /// Audible speakers in handle order
    pub speakers: Vec<Audible>,
}

/// Shared engine state and the operations on it
pub struct Engine {
    state: RwLock<ClientState>,
    settings: Arc<RwLock<SpatialSettings>>,
    events: Arc<EventDispatcher>,
    channel: VoiceChannel,
    default_voice_range: f32,
}

impl Engine {
    /// Create an empty engine
    pub fn new(
        channel: VoiceChannel,
        max_clients: usize,
        default_voice_range: f32,
        settings: Arc<RwLock<SpatialSettings>>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            state: RwLock::new(ClientState {
                clients: ClientTable::new(max_clients),
                mutes: MuteStore::new(),
                relative: RelativePositions::new(),
            }),
            settings,
            events,
            channel,
            default_voice_range,
        }
    }

    /// Voice channel clients are sent to
    pub fn channel(&self) -> &VoiceChannel {
        &self.channel
    }

    /// Event dispatcher used for notifications and diagnostics
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Admit a client whose handshake completed.
    ///
    /// Consults the Connecting observer first; a declined or unplaceable
    /// request fires Rejected and allocates nothing.
    pub fn admit(
        &self,
        request: ConnectionRequest,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> crate::Result<Handle> {
        if !self.events.decide_connecting(&request) {
            self.events.log(
                LogLevel::Info,
                format!("Connection from {:?} rejected by host", request.peer_addr),
            );
            self.events.emit(ServerEvent::Rejected(request, RejectReason::Observer));
            return Err(Error::Rejected);
        }

        let mut state = self.state.write();
        let Some(handle) = state.clients.next_free_handle() else {
            drop(state);
            self.events.log(
                LogLevel::Warning,
                format!("Connection from {:?} refused: server full", request.peer_addr),
            );
            self.events.emit(ServerEvent::Rejected(request, RejectReason::ServerFull));
            return Err(Error::ResourceExhausted);
        };

        state.clients.insert(Client::new(
            handle,
            request.voice_client_id,
            request.peer_addr,
            self.default_voice_range,
            tx,
        ));
        self.events.emit(ServerEvent::Connected(handle));
        let total = state.clients.len();
        drop(state);

        self.events.log(
            LogLevel::Info,
            format!("Client {} connected, total clients: {}", handle, total),
        );
        Ok(handle)
    }

    /// Transport-side departure. Fires Disconnected unless the host already
    /// removed the client.
    pub fn release(&self, handle: Handle) -> bool {
        let mut state = self.state.write();
        if state.forget(handle).is_none() {
            return false;
        }
        self.events.emit(ServerEvent::Disconnected(handle));
        let total = state.clients.len();
        drop(state);

        self.events.log(
            LogLevel::Info,
            format!("Client {} disconnected, total clients: {}", handle, total),
        );
        true
    }

    /// Host-side removal: closes the connection and fires Disconnected
    pub fn remove_client(&self, handle: Handle) -> crate::Result<()> {
        let mut state = self.state.write();
        let client = state.forget(handle).ok_or(Error::NotFound(handle))?;
        client.send(ServerMessage::Close);
        self.events.emit(ServerEvent::Disconnected(handle));
        drop(state);

        self.events
            .log(LogLevel::Info, format!("Client {} removed by host", handle));
        Ok(())
    }

    /// Remove every client at once; Disconnected fires only when `notify`
    pub fn remove_all_clients(&self, notify: bool) -> usize {
        let mut state = self.state.write();
        let removed = state.clients.drain();
        state.mutes.clear();
        state.relative.clear();
        for client in &removed {
            client.send(ServerMessage::Close);
            if notify {
                self.events.emit(ServerEvent::Disconnected(client.handle));
            }
        }
        drop(state);

        if !removed.is_empty() {
            self.events.log(
                LogLevel::Info,
                format!("Removed all {} clients", removed.len()),
            );
        }
        removed.len()
    }

    /// Whether `handle` names a connected client
    pub fn is_client_connected(&self, handle: Handle) -> bool {
        self.state.read().clients.contains(handle)
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Up to `max_count` connected handles, ascending; excess handles are omitted
    pub fn client_handles(&self, max_count: usize) -> Vec<Handle> {
        self.state.read().clients.handles(max_count)
    }

    /// Set the display name and push it to the client
    pub fn set_client_nickname(&self, handle: Handle, nickname: &str) -> crate::Result<()> {
        let mut state = self.state.write();
        let client = state.require_mut(handle)?;
        client.nickname = nickname.to_string();

        let msg = Message::ServerNickname(ServerNickname {
            nickname: client.nickname.clone(),
        });
        client.send(ServerMessage::Text(msg.to_json()?));
        Ok(())
    }

    /// Current display name
    pub fn client_nickname(&self, handle: Handle) -> crate::Result<String> {
        Ok(self.state.read().require(handle)?.nickname.clone())
    }

    /// Apply a status report from the client's voice software, firing an
    /// event for each flag that changed
    pub fn update_status(&self, handle: Handle, report: &ClientStatus) -> crate::Result<()> {
        let mut state = self.state.write();
        let client = state.require_mut(handle)?;

        if let Some(id) = report.voice_client_id {
            client.voice_client_id = id;
        }

        let old = client.status;
        client.status = VoiceStatus {
            talking: report.talking,
            microphone_muted: report.microphone_muted,
            speakers_muted: report.speakers_muted,
        };

        if old.talking != report.talking {
            self.events
                .emit(ServerEvent::TalkingChanged(handle, report.talking));
        }
        if old.speakers_muted != report.speakers_muted {
            self.events
                .emit(ServerEvent::SpeakersMuteChanged(handle, report.speakers_muted));
        }
        if old.microphone_muted != report.microphone_muted {
            self.events.emit(ServerEvent::MicrophoneMuteChanged(
                handle,
                report.microphone_muted,
            ));
        }
        Ok(())
    }

    /// Last reported voice status
    pub fn client_status(&self, handle: Handle) -> crate::Result<VoiceStatus> {
        Ok(self.state.read().require(handle)?.status)
    }

    /// Set the maximum distance at which `handle` can be heard
    pub fn set_client_voice_range(&self, handle: Handle, range: f32) -> crate::Result<()> {
        if !range.is_finite() || range < 0.0 {
            return Err(Error::InvalidArgument(format!("voice range {}", range)));
        }
        self.state.write().require_mut(handle)?.voice_range = range;
        Ok(())
    }

    /// Current voice range
    pub fn client_voice_range(&self, handle: Handle) -> crate::Result<f32> {
        Ok(self.state.read().require(handle)?.voice_range)
    }

    /// Move one client
    pub fn set_client_position(&self, handle: Handle, position: Position) -> crate::Result<()> {
        if !position.is_finite() {
            return Err(Error::InvalidArgument(format!("position {:?}", position)));
        }
        self.state.write().require_mut(handle)?.position = position;
        Ok(())
    }

    /// Move many clients as one snapshot.
    ///
    /// All valid entries land under a single write lock, so the audio tick sees
    /// either none or all of them. Unknown handles and non-finite positions are
    /// skipped; the first such entry is reported as the error.
    pub fn set_client_positions(&self, batch: &[ClientPosition]) -> crate::Result<()> {
        let mut first_error = None;
        let valid: Vec<ClientPosition> = batch
            .iter()
            .filter(|entry| {
                let ok = entry.position.is_finite();
                if !ok && first_error.is_none() {
                    first_error = Some(Error::InvalidArgument(format!(
                        "position {:?} for client {}",
                        entry.position, entry.handle
                    )));
                }
                ok
            })
            .copied()
            .collect();

        let mut state = self.state.write();
        for entry in &valid {
            match state.clients.get_mut(entry.handle) {
                Some(client) => client.position = entry.position,
                None => {
                    if first_error.is_none() {
                        first_error = Some(Error::NotFound(entry.handle));
                    }
                }
            }
        }
        drop(state);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current world position
    pub fn client_position(&self, handle: Handle) -> crate::Result<Position> {
        Ok(self.state.read().require(handle)?.position)
    }

    /// Place `speaker` at `offset` for `listener` only, ignoring world distance
    pub fn set_relative_position(
        &self,
        listener: Handle,
        speaker: Handle,
        offset: Vec3,
    ) -> crate::Result<()> {
        if listener == speaker {
            return Err(Error::InvalidArgument(format!(
                "client {} cannot be placed relative to itself",
                listener
            )));
        }
        if !offset.is_finite() {
            return Err(Error::InvalidArgument(format!("offset {:?}", offset)));
        }
        let mut state = self.state.write();
        state.require(listener)?;
        state.require(speaker)?;
        state.relative.set(listener, speaker, offset);
        Ok(())
    }

    /// Drop the override for one ordered pair
    pub fn reset_relative_position(&self, listener: Handle, speaker: Handle) -> crate::Result<()> {
        let mut state = self.state.write();
        state.require(listener)?;
        state.require(speaker)?;
        state.relative.reset(listener, speaker);
        Ok(())
    }

    /// Drop every override where `speaker` is the speaker
    pub fn reset_all_relative_positions(&self, speaker: Handle) -> crate::Result<()> {
        let mut state = self.state.write();
        state.require(speaker)?;
        state.relative.reset_speaker(speaker);
        Ok(())
    }

    /// Override for the ordered pair, if any
    pub fn relative_position(&self, listener: Handle, speaker: Handle) -> crate::Result<Option<Vec3>> {
        let state = self.state.read();
        state.require(listener)?;
        state.require(speaker)?;
        Ok(state.relative.get(listener, speaker))
    }

    /// Mute or unmute `handle` for every listener
    pub fn mute_client_for_all(&self, handle: Handle, muted: bool) -> crate::Result<()> {
        let mut state = self.state.write();
        state.require(handle)?;
        state.mutes.set_muted_for_all(handle, muted);
        Ok(())
    }

    /// Whether `handle` is muted for every listener
    pub fn is_client_muted_for_all(&self, handle: Handle) -> crate::Result<bool> {
        let state = self.state.read();
        state.require(handle)?;
        Ok(state.mutes.is_muted_for_all(handle))
    }

    /// Mute or unmute `speaker` for `listener` only
    pub fn mute_client_for_client(
        &self,
        speaker: Handle,
        listener: Handle,
        muted: bool,
    ) -> crate::Result<()> {
        let mut state = self.state.write();
        state.require(speaker)?;
        state.require(listener)?;
        state.mutes.set_muted_for_client(speaker, listener, muted);
        Ok(())
    }

    /// Whether `speaker` is muted for `listener` by a pairwise entry
    pub fn is_client_muted_for_client(&self, speaker: Handle, listener: Handle) -> crate::Result<bool> {
        let state = self.state.read();
        state.require(speaker)?;
        state.require(listener)?;
        Ok(state.mutes.is_muted_for_client(speaker, listener))
    }

    /// Volume at which `listener` currently hears `speaker`
    pub fn audible_volume(&self, listener: Handle, speaker: Handle) -> crate::Result<f32> {
        let settings = *self.settings.read();
        let state = self.state.read();
        let l = state.require(listener)?;
        let s = state.require(speaker)?;
        Ok(state.volume(&settings, l, s).0)
    }

    /// Evaluate the spatial model for every listener on one consistent snapshot.
    ///
    /// Listeners with a non-finite position are left out and reported; speakers
    /// without a voice identity are not audible yet.
    pub fn mix(&self) -> Vec<ListenerMix> {
        let settings = *self.settings.read();
        let state = self.state.read();
        let mut mixes = Vec::with_capacity(state.clients.len());
        let mut faulty = Vec::new();

        for listener in state.clients.iter() {
            if !listener.position.is_finite() {
                faulty.push(listener.handle);
                continue;
            }

            let speakers = state
                .clients
                .iter()
                .filter(|s| s.handle != listener.handle && s.voice_client_id != 0)
                .filter_map(|speaker| {
                    let (volume, offset) = state.volume(&settings, listener, speaker);
                    (volume > 0.0).then_some(Audible {
                        handle: speaker.handle,
                        serial: speaker.serial,
                        voice_client_id: speaker.voice_client_id,
                        volume,
                        offset,
                    })
                })
                .collect();

            mixes.push(ListenerMix {
                listener: listener.handle,
                serial: listener.serial,
                speakers,
            });
        }
        drop(state);

        for handle in faulty {
            self.events.log(
                LogLevel::Warning,
                format!("Skipping audio update for client {}: invalid position", handle),
            );
        }
        mixes
    }

    /// Send a message to one client's transport
    pub fn send_to(&self, handle: Handle, msg: ServerMessage) -> bool {
        self.state
            .read()
            .clients
            .get(handle)
            .map(|client| client.send(msg))
            .unwrap_or(false)
    }
}
