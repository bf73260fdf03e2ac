//! Binds a fixed pool of left/right hand slots to haptic gloves that come and go,
//! and routes force-feedback commands only to gloves that are still the ones bound.
//!
//! ```text
//! config ──► LifecycleManager ──tick──► SlotPool ──► PoseUpdate
//!                 ▲      │
//!   FrameSource ──┘      └──► DeviceLink (force feedback)
//! ```

pub mod config;
pub mod device;
pub mod hand;

pub use config::{ConfigError, HapticConfig, TransportConfig};
pub use device::{
    ConnectionStatus, DeviceLink, Finger, FingerCommand, FingerMask, Frame, FrameSource,
    LinkSignal, Orientation, PhysicalDeviceIdentity, PoseSample,
};
pub use hand::{LifecycleManager, LifecycleState, PoseUpdate};
