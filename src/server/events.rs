// ABOUTME: Event dispatch to host observers
// ABOUTME: Typed event queue drained by a single delivery thread, plus the synchronous Connecting hook

use crate::server::registry::Handle;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Severity of an engine diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum LogLevel {
    /// Nothing is delivered
    None = 0,
    /// Failures
    Error = 1,
    /// Degraded operation
    Warning = 2,
    /// Lifecycle information
    Info = 3,
    /// Everything
    Debug = 4,
}

impl LogLevel {
    /// Numeric threshold value
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Level for a numeric threshold; values outside 0..=4 are clamped
    pub fn from_i32(level: i32) -> Self {
        match level {
            i32::MIN..=0 => LogLevel::None,
            1 => LogLevel::Error,
            2 => LogLevel::Warning,
            3 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    fn as_log(self) -> Option<log::Level> {
        match self {
            LogLevel::None => None,
            LogLevel::Error => Some(log::Level::Error),
            LogLevel::Warning => Some(log::Level::Warn),
            LogLevel::Info => Some(log::Level::Info),
            LogLevel::Debug => Some(log::Level::Debug),
        }
    }
}

/// A connection attempt awaiting the host's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Remote transport address
    pub peer_addr: Option<SocketAddr>,
    /// Identity inside the voice channel, 0 if not joined yet
    pub voice_client_id: u16,
    /// Game build reported by the client
    pub game_version: String,
}

/// Why a connection attempt did not produce a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The Connecting observer declined it
    Observer,
    /// No handle was left
    ServerFull,
}

/// Notification delivered to host observers
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Client admitted and registered
    Connected(Handle),
    /// Connection attempt declined; no handle was allocated
    Rejected(ConnectionRequest, RejectReason),
    /// Client left the registry
    Disconnected(Handle),
    /// Voice activity toggled
    TalkingChanged(Handle, bool),
    /// Voice client speakers mute toggled
    SpeakersMuteChanged(Handle, bool),
    /// Voice client microphone mute toggled
    MicrophoneMuteChanged(Handle, bool),
    /// Engine diagnostic
    LogMessage(LogLevel, String),
}

/// Kind of a notification event, used to address observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Synchronous admission hook
    Connecting,
    /// See [`ServerEvent::Connected`]
    Connected,
    /// See [`ServerEvent::Rejected`]
    Rejected,
    /// See [`ServerEvent::Disconnected`]
    Disconnected,
    /// See [`ServerEvent::TalkingChanged`]
    TalkingChanged,
    /// See [`ServerEvent::SpeakersMuteChanged`]
    SpeakersMuteChanged,
    /// See [`ServerEvent::MicrophoneMuteChanged`]
    MicrophoneMuteChanged,
    /// See [`ServerEvent::LogMessage`]
    LogMessage,
}

type ConnectingHandler = Box<dyn Fn(&ConnectionRequest) -> bool + Send + Sync>;
type ClientHandler = Box<dyn Fn(Handle) + Send + Sync>;
type RejectedHandler = Box<dyn Fn(&ConnectionRequest, RejectReason) + Send + Sync>;
type StatusHandler = Box<dyn Fn(Handle, bool) + Send + Sync>;
type LogHandler = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    connecting: Option<ConnectingHandler>,
    connected: Option<ClientHandler>,
    rejected: Option<RejectedHandler>,
    disconnected: Option<ClientHandler>,
    talking_changed: Option<StatusHandler>,
    speakers_mute_changed: Option<StatusHandler>,
    microphone_mute_changed: Option<StatusHandler>,
    log_message: Option<LogHandler>,
}

impl Handlers {
    fn deliver(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Connected(handle) => {
                if let Some(f) = &self.connected {
                    f(*handle);
                }
            }
            ServerEvent::Rejected(request, reason) => {
                if let Some(f) = &self.rejected {
                    f(request, *reason);
                }
            }
            ServerEvent::Disconnected(handle) => {
                if let Some(f) = &self.disconnected {
                    f(*handle);
                }
            }
            ServerEvent::TalkingChanged(handle, on) => {
                if let Some(f) = &self.talking_changed {
                    f(*handle, *on);
                }
            }
            ServerEvent::SpeakersMuteChanged(handle, on) => {
                if let Some(f) = &self.speakers_mute_changed {
                    f(*handle, *on);
                }
            }
            ServerEvent::MicrophoneMuteChanged(handle, on) => {
                if let Some(f) = &self.microphone_mute_changed {
                    f(*handle, *on);
                }
            }
            ServerEvent::LogMessage(level, message) => {
                if let Some(f) = &self.log_message {
                    f(*level, message);
                }
            }
        }
    }

    fn clear(&mut self, kind: EventKind) {
        match kind {
            EventKind::Connecting => self.connecting = None,
            EventKind::Connected => self.connected = None,
            EventKind::Rejected => self.rejected = None,
            EventKind::Disconnected => self.disconnected = None,
            EventKind::TalkingChanged => self.talking_changed = None,
            EventKind::SpeakersMuteChanged => self.speakers_mute_changed = None,
            EventKind::MicrophoneMuteChanged => self.microphone_mute_changed = None,
            EventKind::LogMessage => self.log_message = None,
        }
    }
}

enum Envelope {
    Event(ServerEvent),
    Flush(Sender<()>),
}

/// Routes engine events to at most one observer per kind.
///
/// Notifications are queued and delivered in FIFO order on a dedicated thread,
/// never on the thread that produced them. Observers must not block.
pub struct EventDispatcher {
    handlers: Arc<RwLock<Handlers>>,
    tx: Option<Sender<Envelope>>,
    worker: Option<JoinHandle<()>>,
    log_level: AtomicI32,
}

impl EventDispatcher {
    /// Create a dispatcher and start its delivery thread
    pub fn new() -> Self {
        let handlers = Arc::new(RwLock::new(Handlers::default()));
        let (tx, rx) = channel::unbounded::<Envelope>();

        let worker_handlers = Arc::clone(&handlers);
        let worker = std::thread::Builder::new()
            .name("voxspace-events".to_string())
            .spawn(move || deliver_loop(rx, worker_handlers))
            .map_err(|e| log::error!("Failed to spawn event delivery thread: {}", e))
            .ok();

        Self {
            handlers,
            tx: Some(tx),
            worker,
            log_level: AtomicI32::new(LogLevel::Info.as_i32()),
        }
    }

    /// Queue a notification
    pub fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Envelope::Event(event));
        }
    }

    /// Ask the Connecting observer whether to admit `request`.
    ///
    /// Runs on the caller's thread. Without an observer every request is admitted.
    pub fn decide_connecting(&self, request: &ConnectionRequest) -> bool {
        match &self.handlers.read().connecting {
            Some(f) => f(request),
            None => true,
        }
    }

    /// Record a diagnostic: always through `log`, and as a LogMessage event
    /// when `level` passes the threshold
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        if let Some(lvl) = level.as_log() {
            log::log!(lvl, "{}", message);
        }
        if self.passes(level) {
            self.emit(ServerEvent::LogMessage(level, message));
        }
    }

    /// Set the numeric LogMessage threshold
    pub fn set_log_level(&self, level: i32) {
        self.log_level.store(level, Ordering::Relaxed);
    }

    /// Current numeric LogMessage threshold
    pub fn log_level(&self) -> i32 {
        self.log_level.load(Ordering::Relaxed)
    }

    fn passes(&self, level: LogLevel) -> bool {
        let level = level.as_i32();
        level >= LogLevel::Error.as_i32() && level <= self.log_level()
    }

    /// Block until every event queued before this call has been delivered
    pub fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        if self.worker.is_none() {
            return;
        }
        // A flush issued from inside an observer would wait on itself.
        if std::thread::current().name() == Some("voxspace-events") {
            return;
        }

        let (done_tx, done_rx) = channel::bounded(1);
        if tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Register the synchronous admission hook
    pub fn register_connecting<F>(&self, f: F)
    where
        F: Fn(&ConnectionRequest) -> bool + Send + Sync + 'static,
    {
        self.handlers.write().connecting = Some(Box::new(f));
    }

    /// Register the Connected observer
    pub fn register_connected<F>(&self, f: F)
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        self.handlers.write().connected = Some(Box::new(f));
    }

    /// Register the Rejected observer
    pub fn register_rejected<F>(&self, f: F)
    where
        F: Fn(&ConnectionRequest, RejectReason) + Send + Sync + 'static,
    {
        self.handlers.write().rejected = Some(Box::new(f));
    }

    /// Register the Disconnected observer
    pub fn register_disconnected<F>(&self, f: F)
    where
        F: Fn(Handle) + Send + Sync + 'static,
    {
        self.handlers.write().disconnected = Some(Box::new(f));
    }

    /// Register the TalkingChanged observer
    pub fn register_talking_changed<F>(&self, f: F)
    where
        F: Fn(Handle, bool) + Send + Sync + 'static,
    {
        self.handlers.write().talking_changed = Some(Box::new(f));
    }

    /// Register the SpeakersMuteChanged observer
    pub fn register_speakers_mute_changed<F>(&self, f: F)
    where
        F: Fn(Handle, bool) + Send + Sync + 'static,
    {
        self.handlers.write().speakers_mute_changed = Some(Box::new(f));
    }

    /// Register the MicrophoneMuteChanged observer
    pub fn register_microphone_mute_changed<F>(&self, f: F)
    where
        F: Fn(Handle, bool) + Send + Sync + 'static,
    {
        self.handlers.write().microphone_mute_changed = Some(Box::new(f));
    }

    /// Register the LogMessage observer
    pub fn register_log_message<F>(&self, f: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.handlers.write().log_message = Some(Box::new(f));
    }

    /// Remove the observer for `kind`
    pub fn unregister(&self, kind: EventKind) {
        self.handlers.write().clear(kind);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain what is left and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn deliver_loop(rx: Receiver<Envelope>, handlers: Arc<RwLock<Handlers>>) {
    for envelope in rx.iter() {
        match envelope {
            Envelope::Event(event) => handlers.read().deliver(&event),
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
