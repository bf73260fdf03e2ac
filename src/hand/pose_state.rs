use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::slot_pool::SlotPool;
use crate::device::{Frame, Orientation, PoseSample};

// Notification sent to the animation layer for every fresh pose
#[derive(Debug, Clone, PartialEq)]
pub struct PoseUpdate {
    pub orientation: Orientation,
    pub slot: usize,
    pub pose: PoseSample,
}

/// Copies poses of bound gloves into their slots and notifies consumers.
///
/// Consumers see gaps whenever a slot goes inactive; nothing is interpolated.
#[derive(Debug)]
pub struct PosePropagator {
    sender: mpsc::Sender<PoseUpdate>,
    dropped_notifications: u64,
}

impl PosePropagator {
    pub fn new(sender: mpsc::Sender<PoseUpdate>) -> Self {
        Self {
            sender,
            dropped_notifications: 0,
        }
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications
    }

    /// Updates `last_pose` for every fresh slot. Returns the number of notifications sent.
    pub fn propagate(&mut self, pool: &mut SlotPool, frame: &Frame) -> usize {
        let mut sent = 0;

        for (index, slot) in pool.slots_mut().iter_mut().enumerate() {
            if !slot.is_fresh() {
                continue;
            }
            let Some(pose) = slot.session_id().and_then(|id| frame.pose_for(id)) else {
                continue;
            };
            slot.store_pose(pose.clone());

            let update = PoseUpdate {
                orientation: slot.orientation(),
                slot: index,
                pose: pose.clone(),
            };
            match self.sender.try_send(update) {
                Ok(_) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped_notifications += 1;
                    warn!("Pose channel is full, update for slot {} dropped", index);
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped_notifications += 1;
                    debug!("Pose consumer gone, update for slot {} dropped", index);
                }
            }
        }

        sent
    }
}
