//! Controller error types.

use thiserror::Error;

use relaycast_ipc::{ConfigError, RelayError, SinkKind};

/// Errors returned by instance lifecycle operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("{} sink unavailable and no other output remains: {message}", sink.name())]
    SinkUnavailable { sink: SinkKind, message: String },

    #[error("instance is not running")]
    NotRunning,

    #[error("instance is already running")]
    AlreadyRunning,

    #[error("content failed to load: {0}")]
    HostLoadFailed(String),

    #[error("failed to create instance runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl From<&ControllerError> for RelayError {
    fn from(error: &ControllerError) -> Self {
        match error {
            ControllerError::InvalidConfig(e) => RelayError::InvalidConfig(e.clone()),
            ControllerError::SinkUnavailable { sink, message } => RelayError::SinkUnavailable {
                sink: *sink,
                message: message.clone(),
            },
            ControllerError::NotRunning => RelayError::NotRunning,
            ControllerError::AlreadyRunning => RelayError::AlreadyRunning,
            ControllerError::HostLoadFailed(source) => RelayError::HostLoadFailed(source.clone()),
            ControllerError::Runtime(e) => RelayError::Runtime(e.to_string()),
        }
    }
}
