use std::collections::HashMap;
use tracing::debug;

use crate::device::{DeviceSession, Orientation, PhysicalDeviceIdentity, PoseSample, SessionId};

/// One logical hand-controller position.
///
/// Orientation is fixed at construction. Binding state is only changed by the
/// reconciler, `last_pose` only by pose propagation.
#[derive(Debug, Clone)]
pub struct HandControllerSlot {
    orientation: Orientation,
    binding: Option<DeviceSession>,
    active: bool,
    last_pose: Option<PoseSample>,
    // Consecutive frames in which the bound identity was absent
    missed_frames: u32,
    // Identity held before the last release, for slot affinity
    previous_identity: Option<PhysicalDeviceIdentity>,
}

impl HandControllerSlot {
    pub fn new(orientation: Orientation) -> Self {
        Self {
            orientation,
            binding: None,
            active: false,
            last_pose: None,
            missed_frames: 0,
            previous_identity: None,
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn binding(&self) -> Option<&DeviceSession> {
        self.binding.as_ref()
    }

    pub fn bound_identity(&self) -> Option<&PhysicalDeviceIdentity> {
        self.binding.as_ref().map(|b| &b.identity)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.binding.as_ref().map(|b| b.session_id)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Active and seen in the latest frame.
    pub fn is_fresh(&self) -> bool {
        self.active && self.missed_frames == 0
    }

    pub fn last_pose(&self) -> Option<&PoseSample> {
        self.last_pose.as_ref()
    }

    /// Identity this slot was bound to before its last release.
    pub fn previous_identity(&self) -> Option<&PhysicalDeviceIdentity> {
        self.previous_identity.as_ref()
    }

    pub(crate) fn missed_frames(&self) -> u32 {
        self.missed_frames
    }

    pub(crate) fn bind(&mut self, session: DeviceSession) {
        self.binding = Some(session);
        self.active = true;
        self.missed_frames = 0;
    }

    pub(crate) fn hold(&mut self) {
        self.missed_frames += 1;
    }

    pub(crate) fn release(&mut self) {
        if let Some(binding) = self.binding.take() {
            self.previous_identity = Some(binding.identity);
        }
        self.active = false;
        self.missed_frames = 0;
    }

    pub(crate) fn store_pose(&mut self, pose: PoseSample) {
        self.last_pose = Some(pose);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("Identity {identity} bound to slots {first} and {second}")]
    DoubleBinding {
        identity: PhysicalDeviceIdentity,
        first: usize,
        second: usize,
    },

    #[error("Slot {0} is active without a binding")]
    ActiveWithoutBinding(usize),

    #[error("Slot {slot} ({slot_orientation}) bound to a {session_orientation} session")]
    OrientationMismatch {
        slot: usize,
        slot_orientation: Orientation,
        session_orientation: Orientation,
    },
}

/// Per-slot view published to observers after every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub orientation: Orientation,
    pub active: bool,
    pub identity: Option<PhysicalDeviceIdentity>,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub tick: u64,
    pub slots: Vec<SlotSnapshot>,
}

/// Fixed, ordered set of slots. Never resized after construction.
#[derive(Debug)]
pub struct SlotPool {
    slots: Box<[HandControllerSlot]>,
}

impl SlotPool {
    pub fn new(orientations: &[Orientation]) -> Self {
        debug!("Creating slot pool with layout {:?}", orientations);
        Self {
            slots: orientations.iter().map(|o| HandControllerSlot::new(*o)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[HandControllerSlot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [HandControllerSlot] {
        &mut self.slots
    }

    /// The `nth` slot of the given orientation, counting in pool order.
    pub fn nth_of(&self, orientation: Orientation, nth: usize) -> Option<&HandControllerSlot> {
        self.slots
            .iter()
            .filter(|s| s.orientation == orientation)
            .nth(nth)
    }

    /// Whether the `nth` slot of `orientation` is active; out-of-range is inactive.
    pub fn is_active(&self, orientation: Orientation, nth: usize) -> bool {
        self.nth_of(orientation, nth).is_some_and(|s| s.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    pub fn release_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.release();
        }
    }

    pub fn snapshot(&self, tick: u64) -> PoolSnapshot {
        PoolSnapshot {
            tick,
            slots: self
                .slots
                .iter()
                .map(|s| SlotSnapshot {
                    orientation: s.orientation,
                    active: s.active,
                    identity: s.bound_identity().cloned(),
                    session_id: s.session_id(),
                })
                .collect(),
        }
    }

    /// Checks no-double-binding, active-implies-bound and orientation agreement.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut bound_at: HashMap<&PhysicalDeviceIdentity, usize> = HashMap::new();

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.active && slot.binding.is_none() {
                return Err(InvariantViolation::ActiveWithoutBinding(index));
            }
            let Some(binding) = &slot.binding else {
                continue;
            };
            if binding.orientation != slot.orientation {
                return Err(InvariantViolation::OrientationMismatch {
                    slot: index,
                    slot_orientation: slot.orientation,
                    session_orientation: binding.orientation,
                });
            }
            if let Some(first) = bound_at.insert(&binding.identity, index) {
                return Err(InvariantViolation::DoubleBinding {
                    identity: binding.identity.clone(),
                    first,
                    second: index,
                });
            }
        }
        Ok(())
    }
}
