//! Capture-to-sink engine for relaycast.
//!
//! This crate drives capture instances: it validates configuration, starts
//! and tears down the sinks, adapts the capture rate to downstream demand,
//! converts host frames and audio, and reports lifecycle, statistics and
//! tally events to the orchestrator.

mod controller;
mod error;
mod events;
mod orchestrator;
mod pipeline;
mod rate;
mod stats;

pub use controller::CaptureController;
pub use error::ControllerError;
pub use orchestrator::{Engine, HostFactory};
pub use pipeline::{PipelineTimings, SharedConfig};
pub use rate::{
    paint_rate, select_method, target_rate, AdaptiveRatePolicy, LiveOutputs, RateState,
};
pub use stats::{RateCounter, WeightedAverage};

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaycast_ipc::{EngineCommand, EngineEvent};
use relaycast_transport::AvTransport;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Time an instance runtime gets to finish its tasks on teardown.
pub const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default log directives when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "relaycast_engine=debug,relaycast_capture=info,relaycast_audio=info,relaycast_encoder=info,relaycast_transport=info";

/// Installs the global tracing subscriber.
///
/// Honors `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`]. Returns false
/// if a subscriber was already installed.
pub fn init_logging() -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Create an engine instance with IPC channels.
pub fn create_engine(
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    hosts: Box<dyn HostFactory>,
    transport: Arc<dyn AvTransport>,
) -> Engine {
    Engine::new(command_rx, event_tx, hosts, transport)
}
