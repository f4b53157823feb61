//! Instance state machine types.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a capture instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Not capturing.
    #[default]
    Idle,

    /// Sinks and host are being brought up.
    Starting,

    /// Frames flow to the sinks.
    Running,

    /// Teardown in progress; new frames are rejected.
    Stopping,
}

impl InstanceState {
    /// Returns true if the instance is idle.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the instance is running.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if hot-path callbacks may accept new work.
    pub fn is_accepting(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
        }
    }
}

/// The authoritative state cell of one instance.
///
/// Every hot-path callback and suspension point consults this cell.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<InstanceState>>,
}

impl SharedState {
    /// Creates a cell in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn get(&self) -> InstanceState {
        *self.inner.read()
    }

    /// Replaces the state and returns the previous one.
    pub fn set(&self, state: InstanceState) -> InstanceState {
        std::mem::replace(&mut *self.inner.write(), state)
    }

    /// Returns true if new work may be accepted.
    pub fn is_accepting(&self) -> bool {
        self.get().is_accepting()
    }
}

/// Startup phases of an instance, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Opening the network sender.
    StartNetwork,

    /// Launching the subprocess encoder.
    StartEncoder,

    /// Spawning the conversion pipeline.
    StartPipeline,

    /// Loading content in the rendering host.
    LoadHost,
}

impl StartupPhase {
    /// The first phase of a start sequence.
    pub const FIRST: Self = Self::StartNetwork;

    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::StartNetwork => Some(Self::StartEncoder),
            Self::StartEncoder => Some(Self::StartPipeline),
            Self::StartPipeline => Some(Self::LoadHost),
            Self::LoadHost => None,
        }
    }

    /// Returns the previous phase, if any (for rollback).
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::StartNetwork => None,
            Self::StartEncoder => Some(Self::StartNetwork),
            Self::StartPipeline => Some(Self::StartEncoder),
            Self::LoadHost => Some(Self::StartPipeline),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::StartNetwork => "Starting network sender",
            Self::StartEncoder => "Starting encoder",
            Self::StartPipeline => "Starting pipeline",
            Self::LoadHost => "Loading content",
        }
    }
}
