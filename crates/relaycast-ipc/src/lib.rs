//! Typed orchestrator<->engine messages for relaycast.
//!
//! This crate defines the instance configuration record, the commands the
//! orchestration collaborator sends to the engine and the events the engine
//! reports back.

mod commands;
mod error;
mod events;
mod state;
mod types;

pub use commands::EngineCommand;
pub use error::{RelayError, SinkKind};
pub use events::{EngineEvent, LatencyStatistics, LifecycleEvent};
pub use state::{InstanceState, SharedState, StartupPhase};
pub use types::{
    ConfigError, EncoderConfig, InstanceConfig, InstanceId, MediaType, RateControlMode, Tally,
    MAX_CHANNELS, MAX_FRAME_RATE, SUPPORTED_SAMPLE_RATES,
};

use crossbeam_channel::{Receiver, Sender};

/// Commands the engine has not picked up yet. The collaborator issues them
/// one user action at a time, so a short queue is enough.
pub const COMMAND_QUEUE_DEPTH: usize = 32;

/// Events the collaborator has not drained yet. Previews, statistics and
/// rates arrive per instance at up to the frame rate, lifecycle events are
/// interleaved with them; events beyond this are dropped by the engine.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

/// The orchestration collaborator's end of the engine link.
#[derive(Debug, Clone)]
pub struct OrchestratorLink {
    pub commands: Sender<EngineCommand>,
    pub events: Receiver<EngineEvent>,
}

/// The engine's end of the link.
#[derive(Debug, Clone)]
pub struct EngineLink {
    pub commands: Receiver<EngineCommand>,
    pub events: Sender<EngineEvent>,
}

/// Connects an orchestration collaborator to an engine.
pub fn engine_link() -> (OrchestratorLink, EngineLink) {
    let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_QUEUE_DEPTH);
    let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_QUEUE_DEPTH);
    (
        OrchestratorLink {
            commands: command_tx,
            events: event_rx,
        },
        EngineLink {
            commands: command_rx,
            events: event_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_carries_both_directions() {
        let (orchestrator, engine) = engine_link();

        orchestrator
            .commands
            .send(EngineCommand::Reload {
                instance: "cam-1".to_string(),
            })
            .unwrap();
        assert_eq!(
            engine.commands.try_recv().ok().and_then(|c| c.instance().map(str::to_string)),
            Some("cam-1".to_string())
        );

        engine.events.send(EngineEvent::Ready).unwrap();
        assert!(matches!(orchestrator.events.try_recv(), Ok(EngineEvent::Ready)));
        assert_eq!(engine.events.capacity(), Some(EVENT_QUEUE_DEPTH));
    }
}
