// ABOUTME: Voice server lifecycle controller and host control surface
// ABOUTME: Owns the runtime, the WebSocket endpoint and the audio tick; delegates client calls to the engine

use crate::error::Error;
use crate::server::audio_engine::spawn_audio_engine;
use crate::server::channel::{ChannelVerifier, StaticChannelVerifier};
use crate::server::client_handler::handle_client;
use crate::server::config::ServerConfig;
use crate::server::engine::Engine;
use crate::server::events::{ConnectionRequest, EventDispatcher, EventKind, LogLevel, RejectReason};
use crate::server::registry::{Handle, VoiceStatus};
use crate::server::spatial::{ClientPosition, Position, SpatialSettings, Vec3};
use axum::{
    extract::ws::WebSocketUpgrade,
    extract::{ConnectInfo, State},
    response::IntoResponse,
    routing::any,
    Router,
};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// Lifecycle of a [`VoiceServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No server configured
    Uninitialized,
    /// Configured, not serving
    Created,
    /// Accepting clients and ticking audio
    Running,
    /// Served before, now halted
    Stopped,
}

impl LifecycleState {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    handshake_timeout: Duration,
}

/// Network service of a running server
struct Service {
    runtime: Runtime,
    http_shutdown: watch::Sender<bool>,
    audio_shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

struct Instance {
    config: ServerConfig,
    engine: Arc<Engine>,
    state: LifecycleState,
    service: Option<Service>,
}

/// Positional voice server
///
/// All methods are synchronous and safe to call from any thread that is not
/// itself driving a tokio runtime. Event observers may be registered in any
/// lifecycle state and survive `destroy()`.
pub struct VoiceServer {
    inner: Mutex<Option<Instance>>,
    events: Arc<EventDispatcher>,
    settings: Arc<RwLock<SpatialSettings>>,
    /// Set once the host called `set_3d_settings`; wins over `ServerConfig::spatial`
    host_settings: AtomicBool,
    verifier: Box<dyn ChannelVerifier>,
}

impl VoiceServer {
    /// Create an uninitialized server with the default channel verifier
    pub fn new() -> Self {
        Self::with_verifier(StaticChannelVerifier)
    }

    /// Create an uninitialized server that checks the voice channel with `verifier`
    pub fn with_verifier(verifier: impl ChannelVerifier + 'static) -> Self {
        Self {
            inner: Mutex::new(None),
            events: Arc::new(EventDispatcher::new()),
            settings: Arc::new(RwLock::new(SpatialSettings::default())),
            host_settings: AtomicBool::new(false),
            verifier: Box::new(verifier),
        }
    }

    /// Configure the server. Fails with `InvalidState` unless uninitialized.
    pub fn create(&self, config: ServerConfig) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(instance) = inner.as_ref() {
            return Err(Error::InvalidState {
                operation: "create",
                state: instance.state.as_str(),
            });
        }

        if !config.spatial.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "3D settings {:?}",
                config.spatial
            )));
        }
        if !self.host_settings.load(Ordering::Relaxed) {
            *self.settings.write() = config.spatial;
        }
        self.events.set_log_level(config.log_level.as_i32());

        let engine = Arc::new(Engine::new(
            config.channel.clone(),
            config.max_clients,
            config.default_voice_range,
            Arc::clone(&self.settings),
            Arc::clone(&self.events),
        ));

        self.events.log(
            LogLevel::Info,
            format!(
                "Server created on port {} for channel {} on {}",
                config.port, config.channel.channel_id, config.channel.server_id
            ),
        );

        *inner = Some(Instance {
            config,
            engine,
            state: LifecycleState::Created,
            service: None,
        });
        Ok(())
    }

    /// Release everything and return to `Uninitialized`. Stops first if running.
    pub fn destroy(&self) {
        let instance = self.inner.lock().take();
        if let Some(mut instance) = instance {
            if instance.service.is_some() {
                self.halt(&mut instance);
            }
            instance.engine.remove_all_clients(false);
            self.events.log(LogLevel::Info, "Server destroyed");
        }
        self.events.flush();
    }

    /// Start serving: verify the channel, bind the port, spawn the transport
    /// and the audio tick. On failure the state is unchanged.
    pub fn start(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let instance = inner.as_mut().ok_or(Error::InvalidState {
            operation: "start",
            state: LifecycleState::Uninitialized.as_str(),
        })?;
        if instance.state == LifecycleState::Running {
            return Err(Error::InvalidState {
                operation: "start",
                state: instance.state.as_str(),
            });
        }

        if let Err(reason) = self.verifier.verify(&instance.config.channel) {
            self.events.log(
                LogLevel::Error,
                format!("Voice channel verification failed: {}", reason),
            );
            return Err(Error::Channel(reason));
        }

        let service = match self.spawn_service(&instance.config, &instance.engine) {
            Ok(service) => service,
            Err(e) => {
                self.events.log(
                    LogLevel::Error,
                    format!(
                        "Failed to start server on {}: {}",
                        instance.config.bind_addr(),
                        e
                    ),
                );
                return Err(e);
            }
        };

        self.events.log(
            LogLevel::Info,
            format!(
                "Voice server listening on {} (endpoint: {})",
                service.local_addr, instance.config.ws_path
            ),
        );
        instance.service = Some(service);
        instance.state = LifecycleState::Running;
        Ok(())
    }

    fn spawn_service(&self, config: &ServerConfig, engine: &Arc<Engine>) -> crate::Result<Service> {
        if !config.ws_path.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "endpoint path {:?} must start with '/'",
                config.ws_path
            )));
        }

        let std_listener = std::net::TcpListener::bind(config.bind_addr())?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("voxspace-net")
            .enable_all()
            .build()?;
        let (listener, audio_shutdown) = {
            let _guard = runtime.enter();
            let listener = tokio::net::TcpListener::from_std(std_listener)?;

            // Start audio engine
            let (_audio_handle, audio_shutdown) =
                spawn_audio_engine(Arc::clone(engine), config.tick_interval_ms);
            (listener, audio_shutdown)
        };

        let state = AppState {
            engine: Arc::clone(engine),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
        };
        let app = Router::new()
            .route(&config.ws_path, any(ws_handler))
            .with_state(state);

        let (http_shutdown, mut shutdown_rx) = watch::channel(false);
        let events = Arc::clone(&self.events);
        runtime.spawn(async move {
            let shutdown_signal = async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            };
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal)
            .await;
            if let Err(e) = served {
                events.log(LogLevel::Error, format!("Transport stopped: {}", e));
            }
        });

        Ok(Service {
            runtime,
            http_shutdown,
            audio_shutdown,
            local_addr,
        })
    }

    /// Stop serving. Clients are removed in bulk; Disconnected only fires for
    /// them when the config disabled silent bulk removal.
    pub fn stop(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let instance = inner.as_mut().ok_or(Error::InvalidState {
            operation: "stop",
            state: LifecycleState::Uninitialized.as_str(),
        })?;
        if instance.state != LifecycleState::Running {
            return Err(Error::InvalidState {
                operation: "stop",
                state: instance.state.as_str(),
            });
        }

        self.halt(instance);
        Ok(())
    }

    fn halt(&self, instance: &mut Instance) {
        if let Some(service) = instance.service.take() {
            let _ = service.audio_shutdown.send(true);
            let _ = service.http_shutdown.send(true);
            instance
                .engine
                .remove_all_clients(!instance.config.silent_bulk_removal);
            service.runtime.shutdown_background();
        }
        instance.state = LifecycleState::Stopped;
        self.events.log(LogLevel::Info, "Server stopped");
    }

    /// Whether the server is accepting clients
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.inner
            .lock()
            .as_ref()
            .map(|i| i.state)
            .unwrap_or(LifecycleState::Uninitialized)
    }

    /// Bound listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .as_ref()
            .and_then(|i| i.service.as_ref())
            .map(|s| s.local_addr)
    }

    /// The configuration passed to `create`
    pub fn config(&self) -> Option<ServerConfig> {
        self.inner.lock().as_ref().map(|i| i.config.clone())
    }

    fn engine(&self, operation: &'static str) -> crate::Result<Arc<Engine>> {
        self.inner
            .lock()
            .as_ref()
            .map(|i| Arc::clone(&i.engine))
            .ok_or(Error::InvalidState {
                operation,
                state: LifecycleState::Uninitialized.as_str(),
            })
    }

    // Registry

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.engine("count clients")
            .map(|e| e.client_count())
            .unwrap_or(0)
    }

    /// Up to `max_count` connected handles, ascending; excess handles are omitted
    pub fn client_handles(&self, max_count: usize) -> Vec<Handle> {
        self.engine("list clients")
            .map(|e| e.client_handles(max_count))
            .unwrap_or_default()
    }

    /// Whether `handle` names a connected client
    pub fn is_client_connected(&self, handle: Handle) -> bool {
        self.engine("query client")
            .map(|e| e.is_client_connected(handle))
            .unwrap_or(false)
    }

    /// Disconnect one client; fires Disconnected
    pub fn remove_client(&self, handle: Handle) -> crate::Result<()> {
        self.engine("remove client")?.remove_client(handle)
    }

    /// Disconnect every client without per-client events
    pub fn remove_all_clients(&self) -> crate::Result<usize> {
        Ok(self.engine("remove clients")?.remove_all_clients(false))
    }

    /// Set a client's display name
    pub fn set_client_nickname(&self, handle: Handle, nickname: &str) -> crate::Result<()> {
        self.engine("set nickname")?
            .set_client_nickname(handle, nickname)
    }

    /// A client's display name
    pub fn client_nickname(&self, handle: Handle) -> crate::Result<String> {
        self.engine("query client")?.client_nickname(handle)
    }

    /// Last status reported by a client's voice software
    pub fn client_status(&self, handle: Handle) -> crate::Result<VoiceStatus> {
        self.engine("query client")?.client_status(handle)
    }

    // Spatial audio

    /// Set the attenuation curve; effective from the next tick, in any state
    ///
    /// Non-finite or negative factors are ignored with a Warning LogMessage.
    /// A curve set here survives a later `create`.
    pub fn set_3d_settings(&self, distance_factor: f32, rolloff_factor: f32) {
        let settings = SpatialSettings {
            distance_factor,
            rolloff_factor,
        };
        if !settings.is_valid() {
            self.events.log(
                LogLevel::Warning,
                format!("Ignoring invalid 3D settings {:?}", settings),
            );
            return;
        }
        *self.settings.write() = settings;
        self.host_settings.store(true, Ordering::Relaxed);
    }

    /// Current attenuation curve
    pub fn settings_3d(&self) -> SpatialSettings {
        *self.settings.read()
    }

    /// Set the distance at which a client stops being audible
    pub fn set_client_voice_range(&self, handle: Handle, range: f32) -> crate::Result<()> {
        self.engine("set voice range")?
            .set_client_voice_range(handle, range)
    }

    /// A client's voice range
    pub fn client_voice_range(&self, handle: Handle) -> crate::Result<f32> {
        self.engine("query client")?.client_voice_range(handle)
    }

    /// Move one client
    pub fn set_client_position(
        &self,
        handle: Handle,
        x: f32,
        y: f32,
        z: f32,
        rotation: f32,
    ) -> crate::Result<()> {
        self.engine("set position")?
            .set_client_position(handle, Position::new(x, y, z, rotation))
    }

    /// Move many clients as one snapshot
    pub fn set_client_positions(&self, batch: &[ClientPosition]) -> crate::Result<()> {
        self.engine("set positions")?.set_client_positions(batch)
    }

    /// A client's world position
    pub fn client_position(&self, handle: Handle) -> crate::Result<Position> {
        self.engine("query client")?.client_position(handle)
    }

    /// Place `speaker` at a fixed offset for `listener`
    pub fn set_relative_position(
        &self,
        listener: Handle,
        speaker: Handle,
        x: f32,
        y: f32,
        z: f32,
    ) -> crate::Result<()> {
        self.engine("set relative position")?
            .set_relative_position(listener, speaker, Vec3::new(x, y, z))
    }

    /// Drop one relative-position override
    pub fn reset_relative_position(&self, listener: Handle, speaker: Handle) -> crate::Result<()> {
        self.engine("reset relative position")?
            .reset_relative_position(listener, speaker)
    }

    /// Drop every override where `speaker` is the speaker
    pub fn reset_all_relative_positions(&self, speaker: Handle) -> crate::Result<()> {
        self.engine("reset relative positions")?
            .reset_all_relative_positions(speaker)
    }

    /// The override `listener` has for `speaker`, if any
    pub fn relative_position(&self, listener: Handle, speaker: Handle) -> crate::Result<Option<Vec3>> {
        self.engine("query relative position")?
            .relative_position(listener, speaker)
    }

    /// Volume at which `listener` hears `speaker` right now
    pub fn audible_volume(&self, listener: Handle, speaker: Handle) -> crate::Result<f32> {
        self.engine("query volume")?.audible_volume(listener, speaker)
    }

    // Muting

    /// Mute or unmute a client for everyone
    pub fn mute_client_for_all(&self, handle: Handle, muted: bool) -> crate::Result<()> {
        self.engine("mute client")?.mute_client_for_all(handle, muted)
    }

    /// Whether a client is muted for everyone
    pub fn is_client_muted_for_all(&self, handle: Handle) -> crate::Result<bool> {
        self.engine("query mute")?.is_client_muted_for_all(handle)
    }

    /// Mute or unmute `speaker` for `listener` only
    pub fn mute_client_for_client(
        &self,
        speaker: Handle,
        listener: Handle,
        muted: bool,
    ) -> crate::Result<()> {
        self.engine("mute client")?
            .mute_client_for_client(speaker, listener, muted)
    }

    /// Whether `speaker` is muted for `listener`
    pub fn is_client_muted_for_client(&self, speaker: Handle, listener: Handle) -> crate::Result<bool> {
        self.engine("query mute")?
            .is_client_muted_for_client(speaker, listener)
    }

    // Events

    /// Set the numeric LogMessage threshold
    pub fn set_log_level(&self, level: i32) {
        self.events.set_log_level(level);
    }

    /// Block until queued events have been delivered
    pub fn flush_events(&self) {
        self.events.flush();
    }

    /// Register the synchronous admission hook
    pub fn register_client_connecting<F>(&self, f: F)
    where
        F: Fn(&ConnectionRequest) -> bool + Send + Sync + 'static,
    {
        self.events.register_connecting(f);
    }

    /// Register the Connected observer
    pub fn register_client_connected<F>(&self, f: F)
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        self.events.register_connected(f);
    }

    /// Register the Rejected observer
    pub fn register_client_rejected<F>(&self, f: F)
    where
        F: Fn(&ConnectionRequest, RejectReason) + Send + Sync + 'static,
    {
        self.events.register_rejected(f);
    }

    /// Register the Disconnected observer
    pub fn register_client_disconnected<F>(&self, f: F)
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        self.events.register_disconnected(f);
    }

    /// Register the TalkingChanged observer
    pub fn register_client_talking_changed<F>(&self, f: F)
    where
        F: Fn(Handle, bool) + Send + Sync + 'static,
    {
        self.events.register_talking_changed(f);
    }

    /// Register the SpeakersMuteChanged observer
    pub fn register_client_speakers_mute_changed<F>(&self, f: F)
    where
        F: Fn(Handle, bool) + Send + Sync + 'static,
    {
        self.events.register_speakers_mute_changed(f);
    }

    /// Register the MicrophoneMuteChanged observer
    pub fn register_client_microphone_mute_changed<F>(&self, f: F)
    where
        F: Fn(Handle, bool) + Send + Sync + 'static,
    {
        self.events.register_microphone_mute_changed(f);
    }

    /// Register the LogMessage observer
    pub fn register_log_message<F>(&self, f: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.events.register_log_message(f);
    }

    /// Remove the observer of one event kind
    pub fn unregister(&self, kind: EventKind) {
        self.events.unregister(kind);
    }
}

impl Default for VoiceServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VoiceServer {
    fn drop(&mut self) {
        if let Some(instance) = self.inner.get_mut().as_mut() {
            if let Some(service) = instance.service.take() {
                let _ = service.audio_shutdown.send(true);
                let _ = service.http_shutdown.send(true);
                instance.engine.remove_all_clients(false);
                service.runtime.shutdown_background();
            }
        }
    }
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_client(socket, peer_addr, state.engine, state.handshake_timeout)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::channel::VoiceChannel;
    use std::net::{IpAddr, Ipv4Addr};

    fn config() -> ServerConfig {
        ServerConfig::new(0, VoiceChannel::new("abc", 130, "pw"))
            .bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .tick_interval_ms(10)
            .worker_threads(1)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let server = VoiceServer::new();
        assert_eq!(server.state(), LifecycleState::Uninitialized);
        assert!(matches!(server.start(), Err(Error::InvalidState { .. })));

        server.create(config()).unwrap();
        assert_eq!(server.state(), LifecycleState::Created);
        assert!(matches!(
            server.create(config()),
            Err(Error::InvalidState { operation: "create", state: "created" })
        ));

        server.start().unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().is_some());
        assert!(matches!(server.start(), Err(Error::InvalidState { .. })));

        server.stop().unwrap();
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(server.local_addr().is_none());
        assert!(matches!(server.stop(), Err(Error::InvalidState { .. })));

        server.start().unwrap();
        server.destroy();
        assert_eq!(server.state(), LifecycleState::Uninitialized);
        server.create(config()).unwrap();
    }

    #[test]
    fn test_unverifiable_channel_blocks_start() {
        let server = VoiceServer::new();
        server
            .create(ServerConfig::new(0, VoiceChannel::new("", 1, "")))
            .unwrap();
        assert!(matches!(server.start(), Err(Error::Channel(_))));
        assert_eq!(server.state(), LifecycleState::Created);
    }

    #[test]
    fn test_port_in_use_fails_start() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = config();
        config.port = port;
        let server = VoiceServer::new();
        server.create(config).unwrap();
        assert!(matches!(server.start(), Err(Error::Io(_))));
        assert!(!server.is_running());
    }

    #[test]
    fn test_client_calls_need_a_server() {
        let server = VoiceServer::new();
        assert_eq!(server.client_count(), 0);
        assert!(!server.is_client_connected(1));
        assert!(matches!(
            server.mute_client_for_all(1, true),
            Err(Error::InvalidState { .. })
        ));

        // 3D settings are accepted in any state and outlive `create`.
        server.set_3d_settings(0.5, 2.0);
        assert_eq!(server.settings_3d().rolloff_factor, 2.0);
        server.create(config()).unwrap();
        assert_eq!(
            server.settings_3d(),
            SpatialSettings {
                distance_factor: 0.5,
                rolloff_factor: 2.0,
            }
        );
    }

    #[test]
    fn test_create_applies_configured_curve() {
        let server = VoiceServer::new();
        let curve = SpatialSettings {
            distance_factor: 0.2,
            rolloff_factor: 3.0,
        };
        server.create(config().spatial(curve)).unwrap();
        assert_eq!(server.settings_3d(), curve);
    }

    #[test]
    fn test_invalid_3d_settings_are_ignored() {
        let server = VoiceServer::new();
        let (tx, rx) = crossbeam::channel::unbounded();
        server.register_log_message(move |level, _| {
            let _ = tx.send(level);
        });

        server.set_3d_settings(0.5, 2.0);
        server.set_3d_settings(f32::NAN, 1.0);
        server.set_3d_settings(0.1, -1.0);
        assert_eq!(server.settings_3d().distance_factor, 0.5);
        assert_eq!(server.settings_3d().rolloff_factor, 2.0);

        server.flush_events();
        let warnings = rx.try_iter().filter(|l| *l == LogLevel::Warning).count();
        assert_eq!(warnings, 2);

        let bad = SpatialSettings {
            distance_factor: 0.01,
            rolloff_factor: -2.0,
        };
        assert!(matches!(
            VoiceServer::new().create(config().spatial(bad)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
