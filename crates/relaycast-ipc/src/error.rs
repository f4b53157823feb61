//! Failure taxonomy reported to the orchestration collaborator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConfigError, MediaType};

/// Which sink a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Network,
    Subprocess,
}

impl SinkKind {
    /// Returns the display name for this sink.
    pub fn name(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subprocess => "subprocess",
        }
    }
}

/// Externally visible failures.
///
/// Every failure that leaves an instance is delivered as one of these inside
/// an event, never as a panic.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayError {
    /// Configuration rejected before start.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// A sink cannot be initialized on this platform.
    #[error("{} sink unavailable: {message}", sink.name())]
    SinkUnavailable { sink: SinkKind, message: String },

    /// A single audio block failed conversion.
    #[error("malformed audio: {0}")]
    MalformedAudio(String),

    /// A single video frame failed conversion.
    #[error("malformed video: {0}")]
    MalformedVideo(String),

    /// A single write to a sink did not complete.
    #[error("{} {media:?} write failed: {message}", sink.name())]
    SinkWriteFailure {
        sink: SinkKind,
        media: MediaType,
        message: String,
    },

    /// A sink failed for good; it stays down until the instance restarts.
    #[error("{} sink failed: {message}", sink.name())]
    FatalSink { sink: SinkKind, message: String },

    /// The instance is not running.
    #[error("instance is not running")]
    NotRunning,

    /// The instance is already started.
    #[error("instance is already running")]
    AlreadyRunning,

    /// The rendering host failed to load the content.
    #[error("content failed to load: {0}")]
    HostLoadFailed(String),

    /// The instance runtime could not be created.
    #[error("runtime failure: {0}")]
    Runtime(String),
}
