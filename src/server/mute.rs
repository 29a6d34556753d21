// ABOUTME: Mute relationship store
// ABOUTME: Global and per-listener mute flags layered over the spatial model

use crate::server::registry::Handle;
use std::collections::HashSet;

/// Mute flags for connected clients
#[derive(Debug, Default)]
pub struct MuteStore {
    /// Speakers nobody hears
    muted_for_all: HashSet<Handle>,
    /// (speaker, listener) pairs
    muted_pairs: HashSet<(Handle, Handle)>,
}

impl MuteStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear the global mute of `speaker`
    pub fn set_muted_for_all(&mut self, speaker: Handle, muted: bool) {
        if muted {
            self.muted_for_all.insert(speaker);
        } else {
            self.muted_for_all.remove(&speaker);
        }
    }

    /// Whether `speaker` is muted for everyone
    pub fn is_muted_for_all(&self, speaker: Handle) -> bool {
        self.muted_for_all.contains(&speaker)
    }

    /// Set or clear the mute of `speaker` for `listener` only
    pub fn set_muted_for_client(&mut self, speaker: Handle, listener: Handle, muted: bool) {
        if muted {
            self.muted_pairs.insert((speaker, listener));
        } else {
            self.muted_pairs.remove(&(speaker, listener));
        }
    }

    /// Whether `speaker` is muted for `listener` by a pairwise entry
    pub fn is_muted_for_client(&self, speaker: Handle, listener: Handle) -> bool {
        self.muted_pairs.contains(&(speaker, listener))
    }

    /// Whether `listener` must not hear `speaker` (global OR pairwise)
    pub fn blocks(&self, speaker: Handle, listener: Handle) -> bool {
        self.is_muted_for_all(speaker) || self.is_muted_for_client(speaker, listener)
    }

    /// Forget every entry that mentions `handle`
    pub fn purge(&mut self, handle: Handle) {
        self.muted_for_all.remove(&handle);
        self.muted_pairs
            .retain(|&(speaker, listener)| speaker != handle && listener != handle);
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.muted_for_all.clear();
        self.muted_pairs.clear();
    }
}
