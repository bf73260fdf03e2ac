use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Transient per-connection identifier handed out by the device server.
///
/// Reissued on every server restart and on every reconnect; never use it as a
/// continuity key across ticks.
pub type SessionId = u32;

// Which hand a glove or a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Left,
    Right,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orientation::Left => write!(f, "left"),
            Orientation::Right => write!(f, "right"),
        }
    }
}

/// Durable identifier of one physical glove, stable across reconnects.
///
/// Compared by value. Typically the serial number reported by the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalDeviceIdentity(String);

impl PhysicalDeviceIdentity {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhysicalDeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhysicalDeviceIdentity {
    fn from(serial: &str) -> Self {
        Self::new(serial)
    }
}

/// One connected period of a physical glove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub session_id: SessionId,
    pub identity: PhysicalDeviceIdentity,
    pub orientation: Orientation,
    pub connected: bool,
}

// Finger index, in the order used by command batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finger {
    Thumb,
    Index,
    Middle,
    Ring,
    Pinky,
}

impl Finger {
    pub const COUNT: usize = 5;

    pub const ALL: [Finger; Finger::COUNT] = [
        Finger::Thumb,
        Finger::Index,
        Finger::Middle,
        Finger::Ring,
        Finger::Pinky,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Bit set of fingers, one bit per [`Finger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FingerMask(u8);

impl FingerMask {
    pub const NONE: FingerMask = FingerMask(0);
    pub const ALL: FingerMask = FingerMask(0b1_1111);

    pub fn only(finger: Finger) -> Self {
        Self(1 << finger.index())
    }

    pub fn with(self, finger: Finger) -> Self {
        Self(self.0 | (1 << finger.index()))
    }

    pub fn contains(self, finger: Finger) -> bool {
        self.0 & (1 << finger.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    pub fn fingers(self) -> impl Iterator<Item = Finger> {
        Finger::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl FromIterator<Finger> for FingerMask {
    fn from_iter<I: IntoIterator<Item = Finger>>(iter: I) -> Self {
        iter.into_iter().fold(FingerMask::NONE, FingerMask::with)
    }
}

/// Joint rotations of a single finger, in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FingerPose {
    /// Flexion of the proximal, intermediate and distal joints
    pub curl: [f32; 3],
    /// Abduction at the knuckle
    pub splay: f32,
}

/// Immutable snapshot of every tracked finger joint of one hand.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSample {
    pub orientation: Orientation,
    pub captured_at: DateTime<Local>,
    pub fingers: [FingerPose; Finger::COUNT],
}

impl PoseSample {
    pub fn new(orientation: Orientation, fingers: [FingerPose; Finger::COUNT]) -> Self {
        Self {
            orientation,
            captured_at: Local::now(),
            fingers,
        }
    }

    /// Open hand with every joint at rest.
    pub fn relaxed(orientation: Orientation) -> Self {
        Self::new(orientation, [FingerPose::default(); Finger::COUNT])
    }

    pub fn finger(&self, finger: Finger) -> &FingerPose {
        &self.fingers[finger.index()]
    }
}

/// Force-feedback intent for one finger as produced upstream.
///
/// `stiffness == 0.0` means "release".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerCommand {
    pub finger: Finger,
    pub stiffness: f32,
    pub position_setpoint: f32,
    pub inward: bool,
}

impl FingerCommand {
    pub fn release(finger: Finger) -> Self {
        Self {
            finger,
            stiffness: 0.0,
            position_setpoint: 0.0,
            inward: false,
        }
    }

    pub fn is_release(&self) -> bool {
        self.stiffness == 0.0
    }
}

/// Per-finger slot of a device write. `None` leaves that finger's actuator untouched.
pub type FingerBatch = [Option<FingerCommand>; Finger::COUNT];

// One device write
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Aggregated per-finger impedance update
    Impedance(FingerBatch),
    /// Disengage every actuator on the glove
    ReleaseAll,
}

/// Everything the device server knows about one session in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEntry {
    pub identity: PhysicalDeviceIdentity,
    pub orientation: Orientation,
    pub connected: bool,
    pub pose: PoseSample,
}

/// Latest known state of all reachable gloves.
///
/// Keyed by session id; iteration is in ascending session id order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub sessions: BTreeMap<SessionId, FrameEntry>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session_id: SessionId, entry: FrameEntry) {
        self.sessions.insert(session_id, entry);
    }

    /// Sessions currently reported as connected.
    pub fn live_sessions(&self) -> impl Iterator<Item = DeviceSession> + '_ {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.connected)
            .map(|(id, entry)| DeviceSession {
                session_id: *id,
                identity: entry.identity.clone(),
                orientation: entry.orientation,
                connected: true,
            })
    }

    /// Whether the frame explicitly reports `identity` as disconnected.
    pub fn reports_disconnected(&self, identity: &PhysicalDeviceIdentity) -> bool {
        self.sessions
            .values()
            .any(|entry| &entry.identity == identity && !entry.connected)
    }

    pub fn pose_for(&self, session_id: SessionId) -> Option<&PoseSample> {
        self.sessions.get(&session_id).map(|entry| &entry.pose)
    }
}
