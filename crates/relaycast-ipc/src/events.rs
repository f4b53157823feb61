//! Events sent from the engine to the orchestrator.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::types::{InstanceId, MediaType, Tally};

/// Lifecycle notifications of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Starting,
    Started,

    /// Start failed; the instance is idle again.
    Failed { error: RelayError },

    Reloading,
    Reloaded,
    Stopping,
    Stopped,
}

/// Smoothed latency figures in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStatistics {
    /// Weighted moving average over the window.
    pub avg: f64,

    /// Minimum within the window.
    pub min: f64,

    /// Maximum within the window.
    pub max: f64,

    /// Minimum since the instance started.
    pub session_min: f64,

    /// Maximum since the instance started.
    pub session_max: f64,
}

/// Events that the engine can send to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// An instance changed lifecycle state.
    Lifecycle {
        instance: InstanceId,
        event: LifecycleEvent,
    },

    /// Periodic latency statistics.
    Statistics {
        instance: InstanceId,
        media: MediaType,
        stats: LatencyStatistics,
    },

    /// Frames (video) or samples (audio) processed per second.
    Rate {
        instance: InstanceId,
        media: MediaType,
        per_second: u64,
    },

    /// The network tally changed.
    Tally { instance: InstanceId, tally: Tally },

    /// A failure requiring user attention.
    FatalError {
        instance: InstanceId,
        error: RelayError,
    },

    /// Downscaled RGBA thumbnail of the latest captured frame.
    Preview {
        instance: InstanceId,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },

    /// Engine is ready.
    Ready,

    /// Engine has shut down.
    Shutdown,
}
