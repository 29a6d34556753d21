// ABOUTME: Spatial audio model
// ABOUTME: World positions, relative-position overrides and the distance attenuation curve

use crate::server::registry::Handle;
use std::collections::HashMap;

/// 3D vector in world units
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component (vertical)
    pub z: f32,
}

impl Vec3 {
    /// Origin
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    /// Create a vector
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length
    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Rotate about the vertical axis by `angle` radians
    pub fn rotate_z(&self, angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
            z: self.z,
        }
    }

    /// All components finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// As an `[x, y, z]` array
    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// World-space position and heading of a client
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    /// Location
    pub location: Vec3,
    /// Heading in radians about the vertical axis
    pub rotation: f32,
}

impl Position {
    /// Create a position
    pub const fn new(x: f32, y: f32, z: f32, rotation: f32) -> Self {
        Self {
            location: Vec3::new(x, y, z),
            rotation,
        }
    }

    /// All components finite
    pub fn is_finite(&self) -> bool {
        self.location.is_finite() && self.rotation.is_finite()
    }
}

/// One entry of a batch position update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientPosition {
    /// Client to move
    pub handle: Handle,
    /// New position
    pub position: Position,
}

impl ClientPosition {
    /// Create a batch entry
    pub const fn new(handle: Handle, x: f32, y: f32, z: f32, rotation: f32) -> Self {
        Self {
            handle,
            position: Position::new(x, y, z, rotation),
        }
    }
}

/// Global tunables of the attenuation curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialSettings {
    /// Volume lost per world unit
    pub distance_factor: f32,
    /// Exponent applied to the linear falloff
    pub rolloff_factor: f32,
}

impl SpatialSettings {
    /// Both factors finite and non-negative
    pub fn is_valid(&self) -> bool {
        self.distance_factor.is_finite()
            && self.rolloff_factor.is_finite()
            && self.distance_factor >= 0.0
            && self.rolloff_factor >= 0.0
    }
}

impl Default for SpatialSettings {
    fn default() -> Self {
        Self {
            distance_factor: 0.01,
            rolloff_factor: 1.0,
        }
    }
}

/// Volume of a speaker heard at `distance`, in `0.0..=1.0`.
///
/// Zero once `distance` exceeds `voice_range`.
pub fn attenuation(settings: &SpatialSettings, distance: f32, voice_range: f32) -> f32 {
    if !distance.is_finite() || distance > voice_range {
        return 0.0;
    }

    let linear = (1.0 - settings.distance_factor * distance).clamp(0.0, 1.0);
    if linear == 0.0 {
        return 0.0;
    }
    linear.powf(settings.rolloff_factor)
}

/// Offset of `speaker` as seen from `listener`, in the listener's frame
pub fn world_offset(listener: &Position, speaker: &Position) -> Vec3 {
    (speaker.location - listener.location).rotate_z(-listener.rotation)
}

/// Relative-position overrides keyed by ordered (listener, speaker) pair
#[derive(Debug, Default)]
pub struct RelativePositions {
    overrides: HashMap<(Handle, Handle), Vec3>,
}

impl RelativePositions {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `speaker` at `offset` for `listener` only
    pub fn set(&mut self, listener: Handle, speaker: Handle, offset: Vec3) {
        self.overrides.insert((listener, speaker), offset);
    }

    /// Override for the ordered pair, if any
    pub fn get(&self, listener: Handle, speaker: Handle) -> Option<Vec3> {
        self.overrides.get(&(listener, speaker)).copied()
    }

    /// Remove one override; true if it existed
    pub fn reset(&mut self, listener: Handle, speaker: Handle) -> bool {
        self.overrides.remove(&(listener, speaker)).is_some()
    }

    /// Remove every override where `speaker` is the speaker
    pub fn reset_speaker(&mut self, speaker: Handle) -> usize {
        let before = self.overrides.len();
        self.overrides.retain(|&(_, s), _| s != speaker);
        before - self.overrides.len()
    }

    /// Remove every override that mentions `handle` on either side
    pub fn purge(&mut self, handle: Handle) {
        self.overrides
            .retain(|&(listener, speaker), _| listener != handle && speaker != handle);
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.overrides.clear();
    }

    /// Number of overrides
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    /// Whether there are no overrides
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Effective offset for the ordered pair: the override verbatim, or the
    /// world-space offset
    pub fn effective_offset(
        &self,
        listener: Handle,
        listener_pos: &Position,
        speaker: Handle,
        speaker_pos: &Position,
    ) -> Vec3 {
        self.get(listener, speaker)
            .unwrap_or_else(|| world_offset(listener_pos, speaker_pos))
    }
}
