//! Glove-side data model and the transport boundary
//!
//! 1. [`types`] - Sessions, identities, poses and force-feedback commands
//! 2. [`transport`] - Traits the opaque device transport implements
//! 3. [`simulated`] - Loopback rig implementing the transport traits
//!
//! ```text
//! Glove server ──► FrameSource::poll_frame ──► hand core
//!              ◄── DeviceLink::send        ◄──
//!              ──► watch<LinkSignal>       ──►
//! ```

pub mod simulated;
pub mod transport;
pub mod types;

pub use simulated::{SimulatedRig, WriteRecord};
pub use transport::{ConnectionStatus, DeviceLink, FrameSource, LinkSignal, TransportError};
pub use types::{
    DeviceCommand, DeviceSession, Finger, FingerBatch, FingerCommand, FingerMask, FingerPose,
    Frame, FrameEntry, Orientation, PhysicalDeviceIdentity, PoseSample, SessionId,
};
