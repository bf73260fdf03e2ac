//! Lifecycle Manager - owns the slot pool and drives it tick by tick
//!
//! ```text
//! Uninitialized ──start()──► Connecting ──status: Connected──► Ready ──shutdown()──► ShuttingDown ──► Closed
//! ```
//!
//! The transport reports link health on a `watch` channel. That channel is the only
//! state shared with other threads; the manager reads it at the start of every tick
//! and is the only code that mutates slots.

use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchStats, ForceFeedbackDispatcher};
use super::pose_state::{PosePropagator, PoseUpdate};
use super::reconciler::{ReconcileReport, Reconciler};
use super::slot_pool::{PoolSnapshot, SlotPool};
use crate::device::{
    ConnectionStatus, DeviceLink, FingerCommand, FingerMask, FrameSource, LinkSignal,
    Orientation, TransportError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Connecting,
    Ready,
    ShuttingDown,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Slot pool is empty, at least one hand slot must be configured")]
    EmptyPool,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: LifecycleState,
        action: &'static str,
    },
}

/// Runtime knobs for the hand core.
#[derive(Clone, Debug)]
pub struct HandSettings {
    /// Frames a bound glove may be absent before its slot goes inactive
    pub retention_grace_frames: u32,
    /// How often tick statistics are logged
    pub stats_interval: Duration,
}

impl Default for HandSettings {
    fn default() -> Self {
        Self {
            retention_grace_frames: 0,
            stats_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub frames_missing: u64,
    pub poses_sent: u64,
}

/// Result of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    /// `None` when the tick did not reconcile (not ready or link down)
    pub reconcile: Option<ReconcileReport>,
    pub poses_sent: usize,
}

/// What shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Slots that received a release-all command
    pub released: usize,
    /// Release-all writes the link refused
    pub failed: usize,
    /// Shutdown had already run; nothing was done
    pub already_closed: bool,
}

pub struct LifecycleManager {
    state: LifecycleState,
    pool: SlotPool,
    reconciler: Reconciler,
    propagator: PosePropagator,
    dispatcher: ForceFeedbackDispatcher,
    frames: Box<dyn FrameSource>,
    link: Box<dyn DeviceLink>,
    status_rx: Option<watch::Receiver<LinkSignal>>,
    link_signal: LinkSignal,
    snapshot_tx: watch::Sender<PoolSnapshot>,
    settings: HandSettings,
    stats: TickStats,
    last_stats_log: Instant,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state)
            .field("link_signal", &self.link_signal)
            .field("pool", &self.pool)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Builds the manager around a fixed slot layout.
    ///
    /// Fails fast on an empty layout; the pool size never changes afterwards.
    pub fn new(
        layout: &[Orientation],
        settings: HandSettings,
        frames: Box<dyn FrameSource>,
        link: Box<dyn DeviceLink>,
        pose_sender: mpsc::Sender<PoseUpdate>,
    ) -> Result<Self, LifecycleError> {
        if layout.is_empty() {
            error!("Refusing to start with an empty slot layout");
            return Err(LifecycleError::EmptyPool);
        }
        info!("Creating lifecycle manager with {} slots: {:?}", layout.len(), layout);

        let pool = SlotPool::new(layout);
        let (snapshot_tx, _) = watch::channel(pool.snapshot(0));

        Ok(Self {
            state: LifecycleState::Uninitialized,
            reconciler: Reconciler::new(settings.retention_grace_frames),
            propagator: PosePropagator::new(pose_sender),
            dispatcher: ForceFeedbackDispatcher::new(),
            pool,
            frames,
            link,
            status_rx: None,
            link_signal: LinkSignal::default(),
            snapshot_tx,
            settings,
            stats: TickStats::default(),
            last_stats_log: Instant::now(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Receiver for the pool snapshot published after every tick.
    pub fn subscribe(&self) -> watch::Receiver<PoolSnapshot> {
        debug!("New subscriber to pool snapshots");
        self.snapshot_tx.subscribe()
    }

    /// Whether the `nth` slot of `orientation` is currently bound and active.
    pub fn is_active(&self, orientation: Orientation, nth: usize) -> bool {
        self.pool.is_active(orientation, nth)
    }

    /// Opens the device link and subscribes to its status.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(LifecycleError::InvalidTransition {
                state: self.state,
                action: "start",
            });
        }

        info!("Opening device link");
        let status_rx = self.link.open().map_err(|e| {
            error!("Failed to open device link: {}", e);
            e
        })?;
        self.status_rx = Some(status_rx);
        self.state = LifecycleState::Connecting;
        info!("Lifecycle: Uninitialized -> Connecting");

        self.observe_link();
        Ok(())
    }

    /// Runs one fixed-rate tick: link check, reconciliation, pose propagation.
    pub fn tick(&mut self) -> TickReport {
        if !matches!(self.state, LifecycleState::Connecting | LifecycleState::Ready) {
            return TickReport::default();
        }

        self.observe_link();
        self.stats.ticks += 1;
        let mut report = TickReport {
            tick: self.stats.ticks,
            ..TickReport::default()
        };

        if self.state == LifecycleState::Ready && self.link_signal.status == ConnectionStatus::Connected {
            let frame = self.frames.poll_frame();
            if frame.is_none() {
                self.stats.frames_missing += 1;
            }
            let reconcile = self.reconciler.reconcile(&mut self.pool, frame.as_ref());
            if let Some(frame) = &frame {
                report.poses_sent = self.propagator.propagate(&mut self.pool, frame);
                self.stats.poses_sent += report.poses_sent as u64;
            }
            report.reconcile = Some(reconcile);
        }

        self.snapshot_tx.send_replace(self.pool.snapshot(self.stats.ticks));
        self.log_stats_if_due();
        report
    }

    /// Sends an aggregated impedance command to every live slot of `orientation`.
    pub fn control_fingers(&mut self, orientation: Orientation, commands: &[FingerCommand]) -> usize {
        let status = self.dispatch_status();
        self.dispatcher
            .control_fingers(&self.pool, self.link.as_mut(), status, orientation, commands)
    }

    /// Sends an aggregated impedance command to the slot at `slot` only, if it is live.
    pub fn control_slot(&mut self, slot: usize, commands: &[FingerCommand]) -> usize {
        let status = self.dispatch_status();
        self.dispatcher
            .control_slot(&self.pool, self.link.as_mut(), status, slot, commands)
    }

    pub fn release_fingers(&mut self, orientation: Orientation, mask: FingerMask) -> usize {
        let status = self.dispatch_status();
        self.dispatcher
            .release_fingers(&self.pool, self.link.as_mut(), status, orientation, mask)
    }

    pub fn release_all_fingers(&mut self, orientation: Orientation) -> usize {
        self.release_fingers(orientation, FingerMask::ALL)
    }

    /// Releases every active glove, unsubscribes from the link status, closes the link.
    ///
    /// Every step runs even if an earlier one failed. Safe to call repeatedly;
    /// only the first call does anything.
    pub fn shutdown(&mut self) -> ShutdownReport {
        match self.state {
            LifecycleState::ShuttingDown | LifecycleState::Closed => {
                debug!("Shutdown already done, ignoring");
                return ShutdownReport {
                    already_closed: true,
                    ..ShutdownReport::default()
                };
            }
            LifecycleState::Uninitialized => {
                info!("Lifecycle: Uninitialized -> Closed (link never opened)");
                self.state = LifecycleState::Closed;
                return ShutdownReport::default();
            }
            LifecycleState::Connecting | LifecycleState::Ready => {}
        }

        info!("Lifecycle: {} -> ShuttingDown", self.state);
        self.state = LifecycleState::ShuttingDown;
        let mut report = ShutdownReport::default();

        let sessions: Vec<_> = self
            .pool
            .slots()
            .iter()
            .filter(|slot| slot.is_active())
            .filter_map(|slot| slot.session_id())
            .collect();
        for session_id in sessions {
            match self.dispatcher.release_all(self.link.as_mut(), session_id) {
                Ok(()) => report.released += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Release-all on session {} failed: {}", session_id, e);
                }
            }
        }
        self.pool.release_all();

        self.status_rx = None;
        self.link_signal.status = ConnectionStatus::Disconnected;
        self.link.close();
        self.snapshot_tx.send_replace(self.pool.snapshot(self.stats.ticks));

        self.state = LifecycleState::Closed;
        info!(
            "Lifecycle: ShuttingDown -> Closed ({} released, {} failed)",
            report.released, report.failed
        );
        report
    }

    // Status the dispatcher gates on, read fresh from the signal
    fn dispatch_status(&self) -> ConnectionStatus {
        match (&self.state, &self.status_rx) {
            (LifecycleState::Ready, Some(rx)) => rx.borrow().status,
            _ => ConnectionStatus::Disconnected,
        }
    }

    fn observe_link(&mut self) {
        let Some(rx) = self.status_rx.as_mut() else {
            return;
        };
        // A dropped sender means the transport is gone
        let signal = match rx.has_changed() {
            Ok(_) => *rx.borrow_and_update(),
            Err(_) => LinkSignal {
                status: ConnectionStatus::Disconnected,
                ..self.link_signal
            },
        };
        if signal == self.link_signal {
            return;
        }
        let previous = std::mem::replace(&mut self.link_signal, signal);

        match (self.state, signal.status) {
            (LifecycleState::Connecting, ConnectionStatus::Connected) => {
                self.state = LifecycleState::Ready;
                info!("Lifecycle: Connecting -> Ready");
            }
            (LifecycleState::Ready, ConnectionStatus::Connected)
                if previous.status == ConnectionStatus::Connected
                    && signal.reconnected_since(&previous) =>
            {
                // Dropped and came back between two ticks
                let released = self.reconciler.release_all(&mut self.pool);
                warn!(
                    "Device link dropped and recovered since last tick, {} slots forced inactive",
                    released.len()
                );
            }
            (LifecycleState::Ready, ConnectionStatus::Connected) => {
                info!("Device link restored, resuming reconciliation");
            }
            (LifecycleState::Ready, ConnectionStatus::Disconnected) => {
                let released = self.reconciler.release_all(&mut self.pool);
                warn!("Device link lost, {} slots forced inactive", released.len());
            }
            (state, status) => {
                debug!("Link status {:?} while {}", status, state);
            }
        }
    }

    fn log_stats_if_due(&mut self) {
        if self.last_stats_log.elapsed() < self.settings.stats_interval {
            return;
        }
        let dispatch = self.dispatcher.stats();
        info!(
            "Hand core stats: {} ticks, {} without frame, {} poses sent, {} active slots, {} writes, {} dropped, {} failed",
            self.stats.ticks,
            self.stats.frames_missing,
            self.stats.poses_sent,
            self.pool.active_count(),
            dispatch.writes,
            dispatch.dropped,
            dispatch.failed
        );
        if self.propagator.dropped_notifications() > 0 {
            warn!(
                "{} pose notifications dropped so far",
                self.propagator.dropped_notifications()
            );
        }
        self.last_stats_log = Instant::now();
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, Finger, SimulatedRig};

    fn manager_with(rig: &SimulatedRig, layout: &[Orientation]) -> (LifecycleManager, mpsc::Receiver<PoseUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        let manager = LifecycleManager::new(
            layout,
            HandSettings::default(),
            Box::new(rig.clone()),
            Box::new(rig.clone()),
            tx,
        )
        .unwrap();
        (manager, rx)
    }

    #[test]
    fn empty_layout_is_fatal() {
        let rig = SimulatedRig::new();
        let (tx, _rx) = mpsc::channel(1);
        let result = LifecycleManager::new(&[], HandSettings::default(), Box::new(rig.clone()), Box::new(rig), tx);
        assert!(matches!(result, Err(LifecycleError::EmptyPool)));
    }

    #[test]
    fn start_reaches_ready_once_link_reports_connected() {
        let rig = SimulatedRig::new();
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left]);
        assert_eq!(manager.state(), LifecycleState::Uninitialized);

        manager.start().unwrap();

        assert_eq!(manager.state(), LifecycleState::Ready);
        assert!(matches!(
            manager.start(),
            Err(LifecycleError::InvalidTransition { action: "start", .. })
        ));
    }

    #[test]
    fn stays_connecting_until_the_signal_arrives() {
        let rig = SimulatedRig::new();
        rig.set_connect_on_open(false);
        rig.plug("L-1", Orientation::Left);
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left]);

        manager.start().unwrap();
        let report = manager.tick();
        assert_eq!(manager.state(), LifecycleState::Connecting);
        assert!(report.reconcile.is_none());
        assert!(!manager.is_active(Orientation::Left, 0));

        rig.set_status(ConnectionStatus::Connected);
        manager.tick();
        assert_eq!(manager.state(), LifecycleState::Ready);
        assert!(manager.is_active(Orientation::Left, 0));
    }

    #[test]
    fn open_failure_is_reported_at_start() {
        let rig = SimulatedRig::new();
        rig.set_fail_open(true);
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left]);

        assert!(matches!(manager.start(), Err(LifecycleError::Transport(_))));
        assert_eq!(manager.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn link_loss_deactivates_and_reconnect_resumes() {
        let rig = SimulatedRig::new();
        rig.plug("L-1", Orientation::Left);
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left, Orientation::Right]);
        manager.start().unwrap();
        manager.tick();
        assert!(manager.is_active(Orientation::Left, 0));

        rig.set_status(ConnectionStatus::Disconnected);
        let report = manager.tick();
        assert!(report.reconcile.is_none());
        assert!(!manager.is_active(Orientation::Left, 0));
        assert_eq!(
            manager.control_fingers(
                Orientation::Left,
                &[FingerCommand {
                    finger: Finger::Index,
                    stiffness: 1.0,
                    position_setpoint: 0.5,
                    inward: true,
                }]
            ),
            0
        );

        rig.set_status(ConnectionStatus::Connected);
        manager.tick();
        assert!(manager.is_active(Orientation::Left, 0));
    }

    #[test]
    fn link_flap_between_ticks_still_releases() {
        let rig = SimulatedRig::new();
        rig.plug("L-1", Orientation::Left);
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left]);
        manager.start().unwrap();
        assert_eq!(manager.tick().reconcile.unwrap().assigned.len(), 1);

        // Repeating the current status is not an edge
        rig.set_status(ConnectionStatus::Connected);
        assert_eq!(manager.tick().reconcile.unwrap().retained, vec![0]);

        rig.set_status(ConnectionStatus::Disconnected);
        rig.set_status(ConnectionStatus::Connected);
        let report = manager.tick().reconcile.unwrap();

        assert!(report.retained.is_empty());
        assert_eq!(report.assigned.len(), 1);
        assert!(manager.is_active(Orientation::Left, 0));
    }

    #[test]
    fn shutdown_releases_active_slots_exactly_once() {
        let rig = SimulatedRig::new();
        rig.plug("L-1", Orientation::Left);
        rig.plug("R-1", Orientation::Right);
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left, Orientation::Right]);
        manager.start().unwrap();
        manager.tick();
        assert_eq!(manager.pool().active_count(), 2);

        let first = manager.shutdown();
        let second = manager.shutdown();

        assert_eq!(first.released, 2);
        assert!(!first.already_closed);
        assert!(second.already_closed);
        assert_eq!(second.released, 0);
        assert_eq!(manager.state(), LifecycleState::Closed);
        assert!(!rig.is_open());

        let releases = rig
            .writes()
            .into_iter()
            .filter(|w| w.command == DeviceCommand::ReleaseAll)
            .count();
        assert_eq!(releases, 2);
    }

    #[test]
    fn drop_shuts_down() {
        let rig = SimulatedRig::new();
        rig.plug("R-1", Orientation::Right);
        {
            let (mut manager, _rx) = manager_with(&rig, &[Orientation::Right]);
            manager.start().unwrap();
            manager.tick();
        }
        assert!(!rig.is_open());
        assert_eq!(rig.writes().len(), 1);
        assert_eq!(rig.writes()[0].command, DeviceCommand::ReleaseAll);
    }

    #[test]
    fn snapshots_follow_ticks() {
        let rig = SimulatedRig::new();
        rig.plug("L-1", Orientation::Left);
        let (mut manager, _rx) = manager_with(&rig, &[Orientation::Left]);
        let snapshots = manager.subscribe();
        manager.start().unwrap();
        manager.tick();

        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.tick, 1);
        assert!(snapshot.slots[0].active);
        assert_eq!(snapshot.slots[0].identity.as_ref().map(|i| i.as_str()), Some("L-1"));
    }
}
