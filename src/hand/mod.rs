//! Hand core: keeps logical hand slots bound to hot-pluggable gloves
//!
//! 1. [`slot_pool`] - Fixed pool of left/right slots and their bindings
//! 2. [`reconciler`] - Per-tick matching of live sessions to slots
//! 3. [`pose_state`] - Pose propagation to the animation layer
//! 4. [`dispatcher`] - Gated force-feedback writes
//! 5. [`lifecycle`] - Startup, tick loop entry point and shutdown
//!
//! # Tick
//!
//! ```text
//! link status ──► Reconciler ──► PosePropagator ──► PoseUpdate (mpsc)
//!                     │
//!                     └──► SlotPool ──► PoolSnapshot (watch)
//! control intents ──► ForceFeedbackDispatcher ──► DeviceLink
//! ```
//!
//! Everything runs on the thread that calls [`LifecycleManager::tick`]; only the
//! link status crosses threads.

pub mod dispatcher;
pub mod lifecycle;
pub mod pose_state;
pub mod reconciler;
pub mod slot_pool;

pub use dispatcher::{clamp_command, DispatchStats, ForceFeedbackDispatcher};
pub use lifecycle::{
    HandSettings, LifecycleError, LifecycleManager, LifecycleState, ShutdownReport, TickReport,
    TickStats,
};
pub use pose_state::{PosePropagator, PoseUpdate};
pub use reconciler::{ReconcileReport, Reconciler, Rebinding, Release, ReleaseReason};
pub use slot_pool::{HandControllerSlot, InvariantViolation, PoolSnapshot, SlotPool, SlotSnapshot};
