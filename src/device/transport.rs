//! Boundary to the opaque device transport.
//!
//! The core never talks to glove firmware directly. It polls frames through
//! [`FrameSource`] and writes commands through [`DeviceLink`]; connection health
//! arrives asynchronously as a [`LinkSignal`] on a `watch` channel handed out by
//! [`DeviceLink::open`].

use tokio::sync::watch;

use super::types::{DeviceCommand, Frame, SessionId};

/// Health of the link to the device server, as reported by the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

/// Value carried on the link status channel.
///
/// `watch` only keeps the latest value, so a drop and recovery between two reads
/// would look like nothing happened. `generation` counts connect edges, which
/// lets the reader tell "still connected" from "connected again".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkSignal {
    pub status: ConnectionStatus,
    pub generation: u64,
}

impl LinkSignal {
    /// Applies a status report. Returns whether anything changed, for `send_if_modified`.
    pub fn apply(&mut self, status: ConnectionStatus) -> bool {
        if self.status == status {
            return false;
        }
        if status == ConnectionStatus::Connected {
            self.generation += 1;
        }
        self.status = status;
        true
    }

    /// Whether `self` is a connection that started after `earlier` was read.
    pub fn reconnected_since(&self, earlier: &LinkSignal) -> bool {
        self.status == ConnectionStatus::Connected && self.generation != earlier.generation
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to open device link: {0}")]
    OpenFailed(String),

    #[error("Device link is not open")]
    NotOpen,

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

/// Source of per-tick glove frames.
pub trait FrameSource: Send {
    /// Latest frame since the previous poll, or `None` if nothing new arrived.
    ///
    /// Must not block.
    fn poll_frame(&mut self) -> Option<Frame>;
}

/// Command side of the device transport.
pub trait DeviceLink: Send {
    /// Opens the link and subscribes to its status signal.
    fn open(&mut self) -> Result<watch::Receiver<LinkSignal>, TransportError>;

    /// Fire-and-forget write of one command to a session.
    ///
    /// An `Err` only reports that the write was not accepted locally; delivery
    /// failures surface through the status signal.
    fn send(&mut self, session_id: SessionId, command: &DeviceCommand) -> Result<(), TransportError>;

    /// Releases the link. Calling it on a closed link is a no-op.
    fn close(&mut self);
}
