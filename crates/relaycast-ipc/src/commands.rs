//! Commands sent from the orchestrator to the engine.

use serde::{Deserialize, Serialize};

use crate::types::{InstanceConfig, InstanceId};

/// Commands that the orchestrator can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Start a capture instance with the given configuration.
    Start {
        instance: InstanceId,
        config: InstanceConfig,
    },

    /// Replace the configuration of an instance.
    Reconfigure {
        instance: InstanceId,
        config: InstanceConfig,
    },

    /// Reload the rendered content of a running instance.
    Reload { instance: InstanceId },

    /// Stop a capture instance.
    Stop { instance: InstanceId },

    /// Stop every instance and shut the engine down.
    Shutdown,
}

impl EngineCommand {
    /// Returns the instance this command addresses, if any.
    pub fn instance(&self) -> Option<&str> {
        match self {
            Self::Start { instance, .. }
            | Self::Reconfigure { instance, .. }
            | Self::Reload { instance }
            | Self::Stop { instance } => Some(instance),
            Self::Shutdown => None,
        }
    }
}
