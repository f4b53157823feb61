//! Event emission for one instance.

use crossbeam_channel::Sender;
use tracing::warn;

use relaycast_ipc::{EngineEvent, InstanceId, LifecycleEvent, RelayError};

/// Sends events tagged with the instance they belong to.
#[derive(Debug, Clone)]
pub struct Emitter {
    instance: InstanceId,
    tx: Sender<EngineEvent>,
}

impl Emitter {
    pub fn new(instance: impl Into<InstanceId>, tx: Sender<EngineEvent>) -> Self {
        Self {
            instance: instance.into(),
            tx,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn lifecycle(&self, event: LifecycleEvent) {
        self.send(EngineEvent::Lifecycle {
            instance: self.instance.clone(),
            event,
        });
    }

    pub fn fatal(&self, error: RelayError) {
        self.send(EngineEvent::FatalError {
            instance: self.instance.clone(),
            error,
        });
    }

    /// Sends without blocking; a full channel loses the event.
    pub fn send(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(instance = %self.instance, "Failed to send event: {}", e);
        }
    }
}
