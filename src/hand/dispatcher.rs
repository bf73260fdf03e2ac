//! Force-feedback dispatch.
//!
//! Turns finger-level intents into device writes. A write only goes out when the
//! target slot is bound, was seen in the latest frame and the link is up; anything
//! else is dropped on the spot. Commands are never queued or retried, a late
//! impedance update is worse than a missing one.

use tracing::{debug, warn};

use super::slot_pool::SlotPool;
use crate::device::{
    ConnectionStatus, DeviceCommand, DeviceLink, Finger, FingerBatch, FingerCommand, FingerMask,
    Orientation, SessionId, TransportError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Writes accepted by the link
    pub writes: u64,
    /// Intents with no live target
    pub dropped: u64,
    /// Writes the link refused
    pub failed: u64,
    /// Commands that needed clamping
    pub clamped: u64,
}

/// Brings a command into range: setpoint to `[0, 1]`, stiffness to `>= 0`.
///
/// Non-finite stiffness becomes a release, a non-finite setpoint becomes `0`.
/// Returns the sanitized command and whether anything changed.
pub fn clamp_command(command: &FingerCommand) -> (FingerCommand, bool) {
    let stiffness = if command.stiffness.is_finite() {
        command.stiffness.max(0.0)
    } else {
        0.0
    };
    let position_setpoint = if command.position_setpoint.is_finite() {
        command.position_setpoint.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let clamped = stiffness != command.stiffness || position_setpoint != command.position_setpoint;

    (
        FingerCommand {
            finger: command.finger,
            stiffness,
            position_setpoint,
            inward: command.inward,
        },
        clamped,
    )
}

// Which slots a write goes to
#[derive(Debug, Clone, Copy)]
enum Target {
    Hand(Orientation),
    Slot(usize),
}

impl Target {
    fn matches(self, index: usize, orientation: Orientation) -> bool {
        match self {
            Target::Hand(hand) => hand == orientation,
            Target::Slot(slot) => slot == index,
        }
    }
}

#[derive(Debug, Default)]
pub struct ForceFeedbackDispatcher {
    stats: DispatchStats,
}

impl ForceFeedbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Sends one aggregated impedance batch to every live slot of `orientation`.
    ///
    /// Later commands for the same finger replace earlier ones. Returns the
    /// number of writes accepted.
    pub fn control_fingers(
        &mut self,
        pool: &SlotPool,
        link: &mut dyn DeviceLink,
        status: ConnectionStatus,
        orientation: Orientation,
        commands: &[FingerCommand],
    ) -> usize {
        if commands.is_empty() {
            return 0;
        }
        let batch = self.aggregate(commands);
        self.dispatch(pool, link, status, Target::Hand(orientation), DeviceCommand::Impedance(batch))
    }

    /// Like [`control_fingers`](Self::control_fingers), but only for the slot at `slot`.
    ///
    /// For consumers that compute feedback per glove from that glove's own pose.
    pub fn control_slot(
        &mut self,
        pool: &SlotPool,
        link: &mut dyn DeviceLink,
        status: ConnectionStatus,
        slot: usize,
        commands: &[FingerCommand],
    ) -> usize {
        if commands.is_empty() {
            return 0;
        }
        let batch = self.aggregate(commands);
        self.dispatch(pool, link, status, Target::Slot(slot), DeviceCommand::Impedance(batch))
    }

    // Clamps and folds commands into one batch, last command per finger wins
    fn aggregate(&mut self, commands: &[FingerCommand]) -> FingerBatch {
        let mut batch: FingerBatch = [None; Finger::COUNT];
        for command in commands {
            let (command, clamped) = clamp_command(command);
            if clamped {
                self.stats.clamped += 1;
                debug!("Clamped {:?} command to {:?}", command.finger, command);
            }
            batch[command.finger.index()] = Some(command);
        }
        batch
    }

    /// Releases the fingers in `mask` on every live slot of `orientation`.
    pub fn release_fingers(
        &mut self,
        pool: &SlotPool,
        link: &mut dyn DeviceLink,
        status: ConnectionStatus,
        orientation: Orientation,
        mask: FingerMask,
    ) -> usize {
        if mask.is_empty() {
            return 0;
        }

        let mut batch: FingerBatch = [None; Finger::COUNT];
        for finger in mask.fingers() {
            batch[finger.index()] = Some(FingerCommand::release(finger));
        }

        self.dispatch(pool, link, status, Target::Hand(orientation), DeviceCommand::Impedance(batch))
    }

    /// Disengages every actuator of one session, regardless of slot state.
    ///
    /// Shutdown path only.
    pub fn release_all(
        &mut self,
        link: &mut dyn DeviceLink,
        session_id: SessionId,
    ) -> Result<(), TransportError> {
        match link.send(session_id, &DeviceCommand::ReleaseAll) {
            Ok(()) => {
                self.stats.writes += 1;
                debug!("Released all actuators on session {}", session_id);
                Ok(())
            }
            Err(e) => {
                self.stats.failed += 1;
                Err(e)
            }
        }
    }

    fn dispatch(
        &mut self,
        pool: &SlotPool,
        link: &mut dyn DeviceLink,
        status: ConnectionStatus,
        target: Target,
        command: DeviceCommand,
    ) -> usize {
        if status != ConnectionStatus::Connected {
            self.stats.dropped += 1;
            debug!("Link down, {:?} command dropped", target);
            return 0;
        }

        let targets: Vec<SessionId> = pool
            .slots()
            .iter()
            .enumerate()
            .filter(|(index, slot)| target.matches(*index, slot.orientation()) && slot.is_fresh())
            .filter_map(|(_, slot)| slot.session_id())
            .collect();

        if targets.is_empty() {
            self.stats.dropped += 1;
            debug!("No live slot for {:?}, command dropped", target);
            return 0;
        }

        let mut accepted = 0;
        for session_id in targets {
            match link.send(session_id, &command) {
                Ok(()) => {
                    self.stats.writes += 1;
                    accepted += 1;
                }
                Err(e) => {
                    self.stats.failed += 1;
                    warn!("Write to session {} failed: {}", session_id, e);
                }
            }
        }
        accepted
    }
}
