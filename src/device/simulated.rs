//! Loopback device rig.
//!
//! Stands in for the glove server: hands out session ids, reports frames,
//! records every command written to it and lets callers script plug, unplug,
//! reconnect and link failures. Clones share the same rig.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{ConnectionStatus, DeviceLink, FrameSource, LinkSignal, TransportError};
use super::types::{
    DeviceCommand, Finger, FingerPose, Frame, FrameEntry, Orientation, PhysicalDeviceIdentity,
    PoseSample, SessionId,
};

/// A command as it reached the rig.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub session_id: SessionId,
    pub identity: PhysicalDeviceIdentity,
    pub command: DeviceCommand,
}

#[derive(Debug)]
struct SimulatedGlove {
    orientation: Orientation,
    session_id: SessionId,
    connected: bool,
    hidden: bool,
    pose: PoseSample,
}

#[derive(Debug)]
struct RigState {
    next_session_id: SessionId,
    gloves: BTreeMap<PhysicalDeviceIdentity, SimulatedGlove>,
    frames_to_drop: u32,
    open: bool,
    connect_on_open: bool,
    fail_open: bool,
    reject_writes: bool,
    writes: Vec<WriteRecord>,
    status_tx: watch::Sender<LinkSignal>,
}

impl RigState {
    fn issue_session_id(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);
        id
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRig {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(LinkSignal::default());
        Self {
            state: Arc::new(Mutex::new(RigState {
                next_session_id: 1,
                gloves: BTreeMap::new(),
                frames_to_drop: 0,
                open: false,
                connect_on_open: true,
                fail_open: false,
                reject_writes: false,
                writes: Vec::new(),
                status_tx,
            })),
        }
    }

    /// Connects a glove under a fresh session id.
    pub fn plug(&self, identity: impl Into<PhysicalDeviceIdentity>, orientation: Orientation) -> SessionId {
        let identity = identity.into();
        let mut state = self.state.lock();
        let session_id = state.issue_session_id();
        info!("Simulated glove {} ({}) plugged as session {}", identity, orientation, session_id);
        state.gloves.insert(
            identity,
            SimulatedGlove {
                orientation,
                session_id,
                connected: true,
                hidden: false,
                pose: PoseSample::relaxed(orientation),
            },
        );
        session_id
    }

    /// Keeps reporting the glove, flagged as disconnected.
    pub fn unplug(&self, identity: &PhysicalDeviceIdentity) {
        if let Some(glove) = self.state.lock().gloves.get_mut(identity) {
            info!("Simulated glove {} unplugged", identity);
            glove.connected = false;
        }
    }

    /// Drops the glove from frames entirely.
    pub fn forget(&self, identity: &PhysicalDeviceIdentity) {
        self.state.lock().gloves.remove(identity);
    }

    /// Reconnects a known glove under a new session id.
    pub fn reconnect(&self, identity: &PhysicalDeviceIdentity) -> Option<SessionId> {
        let mut state = self.state.lock();
        let session_id = state.issue_session_id();
        let glove = state.gloves.get_mut(identity)?;
        glove.session_id = session_id;
        glove.connected = true;
        glove.hidden = false;
        info!("Simulated glove {} reconnected as session {}", identity, session_id);
        Some(session_id)
    }

    /// Server restart: every glove gets a new session id.
    pub fn restart_server(&self) {
        let mut state = self.state.lock();
        let identities: Vec<_> = state.gloves.keys().cloned().collect();
        for identity in identities {
            let session_id = state.issue_session_id();
            if let Some(glove) = state.gloves.get_mut(&identity) {
                glove.session_id = session_id;
            }
        }
        info!("Simulated server restarted, {} sessions reissued", state.gloves.len());
    }

    /// Hides the glove from frames without flagging it disconnected.
    pub fn set_hidden(&self, identity: &PhysicalDeviceIdentity, hidden: bool) {
        if let Some(glove) = self.state.lock().gloves.get_mut(identity) {
            glove.hidden = hidden;
        }
    }

    /// Reports the glove under a different hand from now on.
    pub fn set_orientation(&self, identity: &PhysicalDeviceIdentity, orientation: Orientation) {
        if let Some(glove) = self.state.lock().gloves.get_mut(identity) {
            glove.orientation = orientation;
            glove.pose.orientation = orientation;
        }
    }

    pub fn set_pose(&self, identity: &PhysicalDeviceIdentity, fingers: [FingerPose; Finger::COUNT]) {
        if let Some(glove) = self.state.lock().gloves.get_mut(identity) {
            glove.pose = PoseSample::new(glove.orientation, fingers);
        }
    }

    /// The next `count` polls return no frame.
    pub fn drop_frames(&self, count: u32) {
        self.state.lock().frames_to_drop = count;
    }

    /// Pushes a status change on the link's signal.
    pub fn set_status(&self, status: ConnectionStatus) {
        let state = self.state.lock();
        debug!("Simulated link status -> {:?}", status);
        state.status_tx.send_if_modified(|signal| signal.apply(status));
    }

    /// Whether `open` reports the link connected straight away.
    pub fn set_connect_on_open(&self, connect: bool) {
        self.state.lock().connect_on_open = connect;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.state.lock().reject_writes = reject;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn session_of(&self, identity: &PhysicalDeviceIdentity) -> Option<SessionId> {
        self.state.lock().gloves.get(identity).map(|g| g.session_id)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Animates finger curls and optionally cycles reconnects until cancelled.
    pub fn spawn_motion(
        &self,
        cancel: CancellationToken,
        update_every: Duration,
        reconnect_every: Option<Duration>,
    ) -> JoinHandle<()> {
        let rig = self.clone();
        // `interval` rejects a zero period
        let update_every = update_every.max(Duration::from_millis(1));
        let reconnect_every = reconnect_every.filter(|period| !period.is_zero());
        tokio::spawn(async move {
            let mut motion = tokio::time::interval(update_every);
            let mut churn = tokio::time::interval(reconnect_every.unwrap_or(Duration::from_secs(3600)));
            churn.tick().await;
            let mut phase: f32 = 0.0;
            let mut next_churn = 0usize;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Simulated motion stopped");
                        break;
                    }
                    _ = motion.tick() => {
                        phase += 0.05;
                        rig.animate(phase);
                    }
                    _ = churn.tick(), if reconnect_every.is_some() => {
                        let identities: Vec<_> = rig.state.lock().gloves.keys().cloned().collect();
                        if identities.is_empty() {
                            warn!("No simulated gloves to reconnect");
                            continue;
                        }
                        let identity = &identities[next_churn % identities.len()];
                        next_churn += 1;
                        rig.reconnect(identity);
                    }
                }
            }
        })
    }

    fn animate(&self, phase: f32) {
        let mut state = self.state.lock();
        for glove in state.gloves.values_mut() {
            let mut fingers = [FingerPose::default(); Finger::COUNT];
            for (i, finger) in fingers.iter_mut().enumerate() {
                let bend = ((phase + i as f32 * 0.4).sin() + 1.0) * 0.6;
                finger.curl = [bend, bend * 0.8, bend * 0.5];
                finger.splay = (phase * 0.5 + i as f32).cos() * 0.1;
            }
            glove.pose = PoseSample::new(glove.orientation, fingers);
        }
    }
}

impl FrameSource for SimulatedRig {
    fn poll_frame(&mut self) -> Option<Frame> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        if state.frames_to_drop > 0 {
            state.frames_to_drop -= 1;
            return None;
        }

        let mut frame = Frame::new();
        for (identity, glove) in state.gloves.iter().filter(|(_, g)| !g.hidden) {
            frame.insert(
                glove.session_id,
                FrameEntry {
                    identity: identity.clone(),
                    orientation: glove.orientation,
                    connected: glove.connected,
                    pose: glove.pose.clone(),
                },
            );
        }
        Some(frame)
    }
}

impl DeviceLink for SimulatedRig {
    fn open(&mut self) -> Result<watch::Receiver<LinkSignal>, TransportError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(TransportError::OpenFailed("simulated open failure".to_string()));
        }
        state.open = true;
        let rx = state.status_tx.subscribe();
        if state.connect_on_open {
            state
                .status_tx
                .send_if_modified(|signal| signal.apply(ConnectionStatus::Connected));
        }
        info!("Simulated device link opened");
        Ok(rx)
    }

    fn send(&mut self, session_id: SessionId, command: &DeviceCommand) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.reject_writes {
            return Err(TransportError::WriteRejected("simulated rejection".to_string()));
        }
        let identity = state
            .gloves
            .iter()
            .find(|(_, g)| g.session_id == session_id && g.connected)
            .map(|(identity, _)| identity.clone())
            .ok_or(TransportError::UnknownSession(session_id))?;

        state.writes.push(WriteRecord {
            session_id,
            identity,
            command: command.clone(),
        });
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state
                .status_tx
                .send_if_modified(|signal| signal.apply(ConnectionStatus::Disconnected));
            info!("Simulated device link closed");
        }
    }
}

/// Identities currently plugged in, for diagnostics.
pub fn plugged_identities(rig: &SimulatedRig) -> BTreeSet<PhysicalDeviceIdentity> {
    rig.state
        .lock()
        .gloves
        .iter()
        .filter(|(_, g)| g.connected)
        .map(|(identity, _)| identity.clone())
        .collect()
}
