// ABOUTME: Audio engine tick
// ABOUTME: Evaluates the spatial model on a fixed interval and pushes audible-set deltas to listeners

use crate::protocol::messages::{Message, ServerUpdate, VolumeUpdate};
use crate::server::engine::{Audible, Engine, ListenerMix};
use crate::server::events::LogLevel;
use crate::server::registry::{Handle, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Smallest volume change worth telling a listener about
const VOLUME_EPSILON: f32 = 0.01;

/// Smallest offset change (world units) worth telling a listener about
const OFFSET_EPSILON: f32 = 0.05;

/// Audible set last sent to one listener connection
#[derive(Debug, Default)]
struct Heard {
    serial: u64,
    speakers: HashMap<Handle, Audible>,
}

/// Audio engine for the per-listener audible sets
pub struct AudioEngine {
    /// Shared engine state
    engine: Arc<Engine>,
    /// Tick interval
    tick_interval: Duration,
    /// What each listener was last told it can hear
    audible: HashMap<Handle, Heard>,
    /// Completed ticks
    ticks: u64,
}

impl AudioEngine {
    /// Create a new audio engine
    pub fn new(engine: Arc<Engine>, tick_interval_ms: u64) -> Self {
        Self {
            engine,
            tick_interval: Duration::from_millis(tick_interval_ms.max(1)),
            audible: HashMap::new(),
            ticks: 0,
        }
    }

    /// Completed ticks
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run the tick loop until `shutdown` turns true
    ///
    /// This should be spawned as a separate task
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "Audio engine started: {}ms ticks",
            self.tick_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Audio engine shutting down after {} ticks", self.ticks);
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate one tick and send each listener the changes to what it hears
    pub fn tick(&mut self) {
        let mixes = self.engine.mix();

        // Forget listeners that left, were skipped this tick, or whose handle
        // now belongs to a newer connection.
        self.audible.retain(|listener, heard| {
            mixes
                .iter()
                .any(|m| m.listener == *listener && m.serial == heard.serial)
        });

        for mix in mixes {
            let previous = self
                .audible
                .remove(&mix.listener)
                .map(|heard| heard.speakers)
                .unwrap_or_default();
            let (volumes, current) = diff(&previous, &mix);

            if !volumes.is_empty() {
                self.send_update(mix.listener, volumes);
            }
            self.audible.insert(
                mix.listener,
                Heard {
                    serial: mix.serial,
                    speakers: current,
                },
            );
        }

        self.ticks += 1;
    }

    fn send_update(&self, listener: Handle, volumes: Vec<VolumeUpdate>) {
        let msg = Message::ServerUpdate(ServerUpdate { volumes });
        match msg.to_json() {
            Ok(json) => {
                self.engine.send_to(listener, ServerMessage::Text(json));
            }
            Err(e) => {
                self.engine.events().log(
                    LogLevel::Error,
                    format!("Failed to serialize update for client {}: {}", listener, e),
                );
            }
        }
    }
}

/// Same connection under the same voice identity
fn same_speaker(old: &Audible, new: &Audible) -> bool {
    old.serial == new.serial && old.voice_client_id == new.voice_client_id
}

/// Changes between what `listener` was told and what it hears now
fn diff(
    previous: &HashMap<Handle, Audible>,
    mix: &ListenerMix,
) -> (Vec<VolumeUpdate>, HashMap<Handle, Audible>) {
    let mut volumes = Vec::new();
    let mut current = HashMap::with_capacity(mix.speakers.len());

    // Speakers that went silent, left, or were replaced by a newer connection
    // on the same handle.
    let mut gone: Vec<&Audible> = previous
        .values()
        .filter(|old| !mix.speakers.iter().any(|s| same_speaker(old, s)))
        .collect();
    gone.sort_by_key(|old| old.handle);
    for old in gone {
        volumes.push(VolumeUpdate {
            voice_client_id: old.voice_client_id,
            handle: old.handle,
            muted: true,
            volume: 0.0,
            position: old.offset.to_array(),
        });
    }

    for speaker in &mix.speakers {
        let known = previous
            .get(&speaker.handle)
            .filter(|old| same_speaker(old, speaker));
        let changed = match known {
            Some(old) => {
                (old.volume - speaker.volume).abs() >= VOLUME_EPSILON
                    || (old.offset - speaker.offset).length() >= OFFSET_EPSILON
            }
            None => true,
        };

        if changed {
            volumes.push(VolumeUpdate {
                voice_client_id: speaker.voice_client_id,
                handle: speaker.handle,
                muted: false,
                volume: speaker.volume,
                position: speaker.offset.to_array(),
            });
            current.insert(speaker.handle, *speaker);
        } else if let Some(old) = known {
            // Keep the last value sent so slow drift still crosses the threshold.
            current.insert(speaker.handle, *old);
        }
    }

    (volumes, current)
}

/// Spawn an audio engine task
pub fn spawn_audio_engine(
    engine: Arc<Engine>,
    tick_interval_ms: u64,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut audio = AudioEngine::new(engine, tick_interval_ms);
        audio.run(shutdown_rx).await;
    });

    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::channel::VoiceChannel;
    use crate::server::events::{ConnectionRequest, EventDispatcher};
    use crate::server::spatial::{Position, SpatialSettings, Vec3};
    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            VoiceChannel::new("abc", 1, ""),
            8,
            20.0,
            Arc::new(RwLock::new(SpatialSettings {
                distance_factor: 0.01,
                rolloff_factor: 1.0,
            })),
            Arc::new(EventDispatcher::new()),
        ))
    }

    fn connect(engine: &Engine, voice_client_id: u16) -> (Handle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = ConnectionRequest {
            peer_addr: None,
            voice_client_id,
            game_version: String::new(),
        };
        (engine.admit(request, tx).unwrap(), rx)
    }

    fn updates(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<Vec<VolumeUpdate>> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::Text(text) = msg {
                if let Ok(Message::ServerUpdate(update)) = Message::from_json(&text) {
                    out.push(update.volumes);
                }
            }
        }
        out
    }

    #[test]
    fn test_engine_creation() {
        let audio = AudioEngine::new(engine(), 0);
        assert_eq!(audio.tick_interval, Duration::from_millis(1));
        assert_eq!(audio.ticks(), 0);
    }

    #[test]
    fn test_listener_told_about_new_and_lost_speakers() {
        let engine = engine();
        let (a, mut ra) = connect(&engine, 10);
        let (b, _rb) = connect(&engine, 11);
        let mut audio = AudioEngine::new(Arc::clone(&engine), 20);

        audio.tick();
        let first = updates(&mut ra);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 1);
        assert_eq!(first[0][0].handle, b);
        assert_eq!(first[0][0].voice_client_id, 11);
        assert!(!first[0][0].muted);

        // Nothing changed: nothing sent.
        audio.tick();
        assert!(updates(&mut ra).is_empty());

        engine.mute_client_for_all(b, true).unwrap();
        audio.tick();
        let muted = updates(&mut ra);
        assert_eq!(muted.len(), 1);
        assert!(muted[0][0].muted);
        assert_eq!(muted[0][0].volume, 0.0);

        engine.mute_client_for_all(b, false).unwrap();
        engine
            .set_client_position(b, Position::new(50.0, 0.0, 0.0, 0.0))
            .unwrap();
        audio.tick();
        let far = updates(&mut ra);
        assert!(far.is_empty(), "50 units is beyond the 20 unit voice range");

        engine.set_relative_position(a, b, Vec3::ZERO).unwrap();
        audio.tick();
        let radio = updates(&mut ra);
        assert_eq!(radio.len(), 1);
        assert!((radio[0][0].volume - 1.0).abs() < 1e-5);
        assert_eq!(audio.ticks(), 5);
    }

    #[test]
    fn test_departed_speaker_reported_once() {
        let engine = engine();
        let (_a, mut ra) = connect(&engine, 10);
        let (b, _rb) = connect(&engine, 11);
        let mut audio = AudioEngine::new(Arc::clone(&engine), 20);

        audio.tick();
        updates(&mut ra);

        engine.release(b);
        audio.tick();
        let gone = updates(&mut ra);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0][0].handle, b);
        assert!(gone[0][0].muted);

        audio.tick();
        assert!(updates(&mut ra).is_empty());
    }

    #[test]
    fn test_newcomer_on_reused_handle_hears_existing_speakers() {
        let engine = engine();
        let (a, _ra) = connect(&engine, 10);
        let (b, _rb) = connect(&engine, 11);
        let mut audio = AudioEngine::new(Arc::clone(&engine), 20);
        audio.tick();

        engine.release(a);
        let (c, mut rc) = connect(&engine, 12);
        assert_eq!(c, a);
        audio.tick();

        let heard = updates(&mut rc);
        assert_eq!(heard.len(), 1);
        assert_eq!(heard[0].len(), 1);
        assert_eq!(heard[0][0].handle, b);
        assert_eq!(heard[0][0].voice_client_id, 11);
        assert!(!heard[0][0].muted);
    }

    #[test]
    fn test_replaced_speaker_identity_is_muted() {
        let engine = engine();
        let (_a, mut ra) = connect(&engine, 10);
        let (b, _rb) = connect(&engine, 11);
        let mut audio = AudioEngine::new(Arc::clone(&engine), 20);
        audio.tick();
        updates(&mut ra);

        engine.release(b);
        let (c, _rc) = connect(&engine, 12);
        assert_eq!(c, b);
        audio.tick();

        let update = updates(&mut ra);
        assert_eq!(update.len(), 1);
        let volumes = &update[0];
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].voice_client_id, 11);
        assert!(volumes[0].muted);
        assert_eq!(volumes[1].voice_client_id, 12);
        assert_eq!(volumes[1].handle, c);
        assert!(!volumes[1].muted);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (handle, shutdown) = spawn_audio_engine(engine(), 5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("engine stops")
            .expect("task completes");
    }
}
