//! Per-tick matching of live glove sessions to slots.
//!
//! A tick runs two passes in a fixed order, enforced by the pass state machine:
//!
//! ```text
//! Frame ──► ReconcilePass<Retaining> ──retain()──► ReconcilePass<Assigning> ──assign()──► ReconcileReport
//!           (keep bound identities)                 (fill free slots by orientation)
//! ```
//!
//! Identity is the continuity key. Session ids change on every reconnect, so a
//! retained slot simply adopts whatever session id its identity shows up under.

use statum::{machine, state};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::slot_pool::SlotPool;
use crate::device::{DeviceSession, Frame, PhysicalDeviceIdentity, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Frame flagged the bound identity as disconnected
    Disconnected,
    /// Bound identity absent for longer than the retention grace
    Lost,
    /// Bound identity reappeared reporting the other hand
    OrientationChanged,
    /// Device link went down
    LinkDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebinding {
    pub slot: usize,
    pub identity: PhysicalDeviceIdentity,
    pub from: SessionId,
    pub to: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub slot: usize,
    pub identity: PhysicalDeviceIdentity,
    pub reason: ReleaseReason,
}

/// What a single reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// No frame was available; bindings were left untouched
    pub frame_missing: bool,
    pub retained: Vec<usize>,
    pub rebound: Vec<Rebinding>,
    /// Bound identity absent this frame but still within grace
    pub held: Vec<usize>,
    pub assigned: Vec<(usize, DeviceSession)>,
    pub released: Vec<Release>,
    /// Connected sessions with no free compatible slot
    pub unbound: Vec<DeviceSession>,
}

impl ReconcileReport {
    /// Whether any slot changed its binding or activity.
    pub fn bindings_changed(&self) -> bool {
        !self.rebound.is_empty() || !self.assigned.is_empty() || !self.released.is_empty()
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum ReconcileState {
    Retaining,
    Assigning,
}

#[machine]
#[derive(Debug)]
pub struct ReconcilePass<S: ReconcileState> {
    // Connected sessions not yet claimed by a slot, ascending by session id
    live: BTreeMap<SessionId, DeviceSession>,

    report: ReconcileReport,
}

impl ReconcilePass<Retaining> {
    pub fn begin(frame: &Frame) -> Self {
        let live: BTreeMap<SessionId, DeviceSession> = frame
            .live_sessions()
            .map(|session| (session.session_id, session))
            .collect();
        debug!("Reconciling against {} live sessions", live.len());

        Self::new(live, ReconcileReport::default())
    }

    /// Keeps active slots on their identity, or demotes them.
    pub fn retain(
        mut self,
        pool: &mut SlotPool,
        frame: &Frame,
        grace_frames: u32,
    ) -> ReconcilePass<Assigning> {
        for (index, slot) in pool.slots_mut().iter_mut().enumerate() {
            if !slot.is_active() {
                continue;
            }
            let Some(previous) = slot.binding().cloned() else {
                continue;
            };

            // A session on the slot's own hand wins over one reporting the other hand
            let same_hand = self
                .live
                .iter()
                .find(|(_, session)| {
                    session.identity == previous.identity && session.orientation == slot.orientation()
                })
                .map(|(id, _)| *id);
            let found = same_hand.or_else(|| {
                self.live
                    .iter()
                    .find(|(_, session)| session.identity == previous.identity)
                    .map(|(id, _)| *id)
            });

            match found {
                Some(session_id) if self.live[&session_id].orientation == slot.orientation() => {
                    if let Some(session) = self.live.remove(&session_id) {
                        if session_id != previous.session_id {
                            info!(
                                "Slot {} kept {} across reconnect (session {} -> {})",
                                index, previous.identity, previous.session_id, session_id
                            );
                            self.report.rebound.push(Rebinding {
                                slot: index,
                                identity: previous.identity.clone(),
                                from: previous.session_id,
                                to: session_id,
                            });
                        } else {
                            self.report.retained.push(index);
                        }
                        slot.bind(session);
                    }
                }
                Some(session_id) => {
                    // Left in `live`; the assignment pass treats it as a new glove
                    warn!(
                        "Glove {} now reports {} on session {}, releasing {} slot {}",
                        previous.identity,
                        self.live[&session_id].orientation,
                        session_id,
                        slot.orientation(),
                        index
                    );
                    slot.release();
                    self.report.released.push(Release {
                        slot: index,
                        identity: previous.identity,
                        reason: ReleaseReason::OrientationChanged,
                    });
                }
                None if frame.reports_disconnected(&previous.identity) => {
                    info!("Glove {} disconnected, slot {} inactive", previous.identity, index);
                    slot.release();
                    self.report.released.push(Release {
                        slot: index,
                        identity: previous.identity,
                        reason: ReleaseReason::Disconnected,
                    });
                }
                None if slot.missed_frames() < grace_frames => {
                    debug!(
                        "Glove {} missing from frame, holding slot {} ({} missed)",
                        previous.identity,
                        index,
                        slot.missed_frames() + 1
                    );
                    slot.hold();
                    self.report.held.push(index);
                }
                None => {
                    info!("Glove {} lost, slot {} inactive", previous.identity, index);
                    slot.release();
                    self.report.released.push(Release {
                        slot: index,
                        identity: previous.identity,
                        reason: ReleaseReason::Lost,
                    });
                }
            }
        }

        self.transition()
    }
}

impl ReconcilePass<Assigning> {
    /// Fills inactive slots, first by affinity, then with the first live
    /// session of matching orientation.
    pub fn assign(mut self, pool: &mut SlotPool) -> ReconcileReport {
        // Identities held by a slot, retained or within grace
        let mut claimed: HashSet<PhysicalDeviceIdentity> = pool
            .slots()
            .iter()
            .filter(|slot| slot.is_active())
            .filter_map(|slot| slot.bound_identity().cloned())
            .collect();

        // Returning gloves reclaim the slot they last held
        for (index, slot) in pool.slots_mut().iter_mut().enumerate() {
            if slot.is_active() {
                continue;
            }
            let Some(previous) = slot.previous_identity() else {
                continue;
            };
            if claimed.contains(previous) {
                continue;
            }
            let candidate = self
                .live
                .iter()
                .find(|(_, session)| {
                    &session.identity == previous && session.orientation == slot.orientation()
                })
                .map(|(id, _)| *id);

            if let Some(session) = candidate.and_then(|id| self.live.remove(&id)) {
                info!(
                    "Slot {} ({}) reclaimed by {} on session {}",
                    index,
                    slot.orientation(),
                    session.identity,
                    session.session_id
                );
                claimed.insert(session.identity.clone());
                slot.bind(session.clone());
                self.report.assigned.push((index, session));
            }
        }

        for (index, slot) in pool.slots_mut().iter_mut().enumerate() {
            if slot.is_active() {
                continue;
            }
            let candidate = self
                .live
                .iter()
                .find(|(_, session)| {
                    session.orientation == slot.orientation() && !claimed.contains(&session.identity)
                })
                .map(|(id, _)| *id);

            if let Some(session) = candidate.and_then(|id| self.live.remove(&id)) {
                info!(
                    "Slot {} ({}) bound to {} on session {}",
                    index,
                    slot.orientation(),
                    session.identity,
                    session.session_id
                );
                claimed.insert(session.identity.clone());
                slot.bind(session.clone());
                self.report.assigned.push((index, session));
            }
        }

        let mut report = std::mem::take(&mut self.report);
        let (duplicates, unbound): (Vec<DeviceSession>, Vec<DeviceSession>) =
            std::mem::take(&mut self.live)
                .into_values()
                .partition(|session| claimed.contains(&session.identity));
        for session in &duplicates {
            debug!(
                "Ignoring session {} of {}, already bound elsewhere",
                session.session_id, session.identity
            );
        }
        report.unbound = unbound;
        if !report.unbound.is_empty() {
            debug!("{} connected gloves have no free slot", report.unbound.len());
        }
        report
    }
}

/// Runs reconciliation passes tick after tick.
#[derive(Debug)]
pub struct Reconciler {
    retention_grace_frames: u32,
    // Latched so "no gloves" is announced once per idle period
    idle_announced: bool,
}

impl Reconciler {
    pub fn new(retention_grace_frames: u32) -> Self {
        Self {
            retention_grace_frames,
            idle_announced: false,
        }
    }

    /// Reconciles the pool against one polled frame.
    ///
    /// `None` means no new frame: bindings stay as they are.
    pub fn reconcile(&mut self, pool: &mut SlotPool, frame: Option<&Frame>) -> ReconcileReport {
        let Some(frame) = frame else {
            debug!("No frame this tick, keeping bindings");
            return ReconcileReport {
                frame_missing: true,
                ..ReconcileReport::default()
            };
        };

        let report = ReconcilePass::begin(frame)
            .retain(pool, frame, self.retention_grace_frames)
            .assign(pool);

        let any_connected = frame.sessions.values().any(|entry| entry.connected);
        if !any_connected && !self.idle_announced {
            info!("No gloves connected, all {} slots idle", pool.len());
            self.idle_announced = true;
        } else if any_connected {
            self.idle_announced = false;
        }

        debug_assert!(
            pool.check_invariants().is_ok(),
            "slot pool invariant broken: {:?}",
            pool.check_invariants()
        );
        report
    }

    /// Drops every binding, used when the link goes down.
    pub fn release_all(&mut self, pool: &mut SlotPool) -> Vec<Release> {
        let mut released = Vec::new();
        for (index, slot) in pool.slots_mut().iter_mut().enumerate() {
            if let Some(identity) = slot.bound_identity().cloned() {
                released.push(Release {
                    slot: index,
                    identity,
                    reason: ReleaseReason::LinkDown,
                });
            }
            slot.release();
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FrameEntry, Orientation, PoseSample};

    fn frame(entries: &[(SessionId, &str, Orientation, bool)]) -> Frame {
        let mut frame = Frame::new();
        for (id, serial, orientation, connected) in entries {
            frame.insert(
                *id,
                FrameEntry {
                    identity: (*serial).into(),
                    orientation: *orientation,
                    connected: *connected,
                    pose: PoseSample::relaxed(*orientation),
                },
            );
        }
        frame
    }

    fn left_right() -> SlotPool {
        SlotPool::new(&[Orientation::Left, Orientation::Right])
    }

    #[test]
    fn binds_by_orientation_and_leaves_other_slot_idle() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);

        let report = reconciler.reconcile(&mut pool, Some(&frame(&[(7, "A", Orientation::Left, true)])));

        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].0, 0);
        assert!(pool.is_active(Orientation::Left, 0));
        assert!(!pool.is_active(Orientation::Right, 0));
        assert_eq!(pool.slots()[0].session_id(), Some(7));
    }

    #[test]
    fn reconnect_under_new_session_keeps_the_slot() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(&mut pool, Some(&frame(&[(7, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(&mut pool, Some(&frame(&[(9, "A", Orientation::Left, true)])));

        assert_eq!(
            report.rebound,
            vec![Rebinding {
                slot: 0,
                identity: "A".into(),
                from: 7,
                to: 9,
            }]
        );
        assert!(report.assigned.is_empty());
        assert_eq!(pool.slots()[0].session_id(), Some(9));
        assert!(!pool.is_active(Orientation::Right, 0));
    }

    #[test]
    fn retention_beats_fresh_assignment() {
        // Two left slots; B arrives on a lower session id than A's new one.
        let mut pool = SlotPool::new(&[Orientation::Left, Orientation::Left]);
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(&mut pool, Some(&frame(&[(5, "A", Orientation::Left, true)])));
        assert_eq!(pool.slots()[0].bound_identity(), Some(&"A".into()));

        reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(2, "B", Orientation::Left, true), (8, "A", Orientation::Left, true)])),
        );

        assert_eq!(pool.slots()[0].bound_identity(), Some(&"A".into()));
        assert_eq!(pool.slots()[1].bound_identity(), Some(&"B".into()));
    }

    #[test]
    fn missing_frame_changes_nothing() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(&mut pool, Some(&frame(&[(1, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(&mut pool, None);

        assert!(report.frame_missing);
        assert!(!report.bindings_changed());
        assert!(pool.is_active(Orientation::Left, 0));
    }

    #[test]
    fn explicit_disconnect_releases_despite_grace() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(5);
        reconciler.reconcile(&mut pool, Some(&frame(&[(1, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(&mut pool, Some(&frame(&[(1, "A", Orientation::Left, false)])));

        assert_eq!(report.released[0].reason, ReleaseReason::Disconnected);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn absence_is_held_for_the_grace_then_released() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(&mut pool, Some(&frame(&[(1, "A", Orientation::Left, true)])));

        let first_gap = reconciler.reconcile(&mut pool, Some(&frame(&[])));
        assert_eq!(first_gap.held, vec![0]);
        assert!(pool.is_active(Orientation::Left, 0));
        assert!(!pool.slots()[0].is_fresh());

        let second_gap = reconciler.reconcile(&mut pool, Some(&frame(&[])));
        assert_eq!(second_gap.released[0].reason, ReleaseReason::Lost);
        assert!(!pool.is_active(Orientation::Left, 0));
    }

    #[test]
    fn zero_grace_releases_on_first_absence() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(&mut pool, Some(&frame(&[(1, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(&mut pool, Some(&frame(&[])));

        assert!(report.held.is_empty());
        assert_eq!(report.released.len(), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn orientation_flip_is_treated_as_a_new_glove() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(&mut pool, Some(&frame(&[(1, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(&mut pool, Some(&frame(&[(2, "A", Orientation::Right, true)])));

        assert_eq!(report.released[0].reason, ReleaseReason::OrientationChanged);
        assert!(!pool.is_active(Orientation::Left, 0));
        assert!(pool.is_active(Orientation::Right, 0));
        assert!(pool.check_invariants().is_ok());
    }

    #[test]
    fn returning_glove_reclaims_its_previous_slot() {
        let mut pool = SlotPool::new(&[Orientation::Left, Orientation::Left]);
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(1, "A", Orientation::Left, true), (2, "B", Orientation::Left, true)])),
        );
        assert_eq!(pool.slots()[1].bound_identity(), Some(&"B".into()));

        // Both gloves drop out for a while, then only B comes back.
        reconciler.reconcile(&mut pool, Some(&frame(&[])));
        reconciler.reconcile(&mut pool, Some(&frame(&[])));
        reconciler.reconcile(&mut pool, Some(&frame(&[(6, "B", Orientation::Left, true)])));

        assert!(!pool.slots()[0].is_active());
        assert_eq!(pool.slots()[1].bound_identity(), Some(&"B".into()));
        assert_eq!(pool.slots()[1].session_id(), Some(6));
    }

    #[test]
    fn identity_listed_twice_binds_only_once() {
        let mut pool = SlotPool::new(&[Orientation::Left, Orientation::Left]);
        let mut reconciler = Reconciler::new(0);

        let report = reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(3, "A", Orientation::Left, true), (9, "A", Orientation::Left, true)])),
        );

        assert_eq!(report.assigned.len(), 1);
        assert!(report.unbound.is_empty());
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.slots()[0].session_id(), Some(3));
        assert!(pool.check_invariants().is_ok());
    }

    #[test]
    fn stale_duplicate_session_does_not_steal_a_free_slot() {
        let mut pool = SlotPool::new(&[Orientation::Left, Orientation::Left]);
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(&mut pool, Some(&frame(&[(3, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(3, "A", Orientation::Left, true), (9, "A", Orientation::Left, true)])),
        );

        assert_eq!(report.retained, vec![0]);
        assert!(report.assigned.is_empty());
        assert!(!pool.slots()[1].is_active());
        assert!(pool.check_invariants().is_ok());
    }

    #[test]
    fn same_hand_session_is_kept_over_a_mirrored_duplicate() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(&mut pool, Some(&frame(&[(4, "A", Orientation::Left, true)])));

        let report = reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(2, "A", Orientation::Right, true), (4, "A", Orientation::Left, true)])),
        );

        assert_eq!(report.retained, vec![0]);
        assert!(report.released.is_empty());
        assert!(!pool.is_active(Orientation::Right, 0));
        assert!(pool.check_invariants().is_ok());
    }

    #[test]
    fn surplus_gloves_stay_unbound() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);

        let report = reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(1, "A", Orientation::Left, true), (2, "B", Orientation::Left, true)])),
        );

        assert_eq!(report.unbound.len(), 1);
        assert_eq!(report.unbound[0].identity.as_str(), "B");
        assert!(!pool.is_active(Orientation::Right, 0));
    }

    #[test]
    fn release_all_reports_every_bound_slot() {
        let mut pool = left_right();
        let mut reconciler = Reconciler::new(0);
        reconciler.reconcile(
            &mut pool,
            Some(&frame(&[(1, "A", Orientation::Left, true), (2, "B", Orientation::Right, true)])),
        );

        let released = reconciler.release_all(&mut pool);

        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|r| r.reason == ReleaseReason::LinkDown));
        assert_eq!(pool.active_count(), 0);
    }
}
