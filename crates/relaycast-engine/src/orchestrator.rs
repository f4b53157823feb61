//! Command loop driving every instance.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, instrument, warn};

use relaycast_capture::RenderHost;
use relaycast_ipc::{EngineCommand, EngineEvent, InstanceConfig, InstanceId, RelayError};
use relaycast_transport::AvTransport;

use crate::controller::CaptureController;
use crate::error::ControllerError;
use crate::events::Emitter;
use crate::pipeline::PipelineTimings;
use crate::rate::AdaptiveRatePolicy;

/// Creates the rendering host of a new instance.
pub trait HostFactory: Send {
    fn create(&mut self, instance: &str, config: &InstanceConfig) -> Box<dyn RenderHost>;
}

impl<F> HostFactory for F
where
    F: FnMut(&str, &InstanceConfig) -> Box<dyn RenderHost> + Send,
{
    fn create(&mut self, instance: &str, config: &InstanceConfig) -> Box<dyn RenderHost> {
        self(instance, config)
    }
}

/// Runs independent capture instances on behalf of the orchestrator.
pub struct Engine {
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    hosts: Box<dyn HostFactory>,
    transport: Arc<dyn AvTransport>,
    policy: AdaptiveRatePolicy,
    timings: PipelineTimings,
    controllers: HashMap<InstanceId, CaptureController>,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        hosts: Box<dyn HostFactory>,
        transport: Arc<dyn AvTransport>,
    ) -> Self {
        Self {
            command_rx,
            event_tx,
            hosts,
            transport,
            policy: AdaptiveRatePolicy::default(),
            timings: PipelineTimings::default(),
            controllers: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: AdaptiveRatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timings(mut self, timings: PipelineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Number of instances not idle.
    pub fn active_instances(&self) -> usize {
        self.controllers
            .values()
            .filter(|c| !c.state().is_idle())
            .count()
    }

    /// Run the engine (blocking).
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");
        self.send_event(EngineEvent::Ready);

        loop {
            match self.command_rx.recv() {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(_) => {
                    info!("Command channel disconnected, shutting down");
                    self.stop_all();
                    break;
                }
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(instance = ?command.instance(), "Handling command");

        match command {
            EngineCommand::Start { instance, config } => self.start(instance, config),
            EngineCommand::Reconfigure { instance, config } => self.reconfigure(&instance, config),
            EngineCommand::Reload { instance } => self.reload(&instance),
            EngineCommand::Stop { instance } => self.stop(&instance),
            EngineCommand::Shutdown => {
                self.stop_all();
                self.send_event(EngineEvent::Shutdown);
                return false;
            }
        }

        true
    }

    fn start(&mut self, instance: InstanceId, config: InstanceConfig) {
        if let Some(controller) = self.controllers.get(&instance) {
            if !controller.state().is_idle() {
                debug!(instance = %instance, "Already running, ignoring start command");
                return;
            }
        }

        let host = self.hosts.create(&instance, &config);
        let mut controller = CaptureController::new(
            instance.clone(),
            host,
            Arc::clone(&self.transport),
            self.event_tx.clone(),
        )
        .with_policy(self.policy)
        .with_timings(self.timings.clone());

        // A failed start has already been reported as a lifecycle event.
        if controller.start(config).is_ok() {
            self.controllers.insert(instance, controller);
        } else {
            self.controllers.remove(&instance);
        }
    }

    fn reconfigure(&mut self, instance: &str, config: InstanceConfig) {
        let result = match self.controllers.get_mut(instance) {
            Some(controller) => controller.reconfigure(config),
            None => Err(ControllerError::NotRunning),
        };
        self.report(instance, result);
    }

    fn reload(&mut self, instance: &str) {
        let result = match self.controllers.get_mut(instance) {
            Some(controller) => controller.reload(),
            None => Err(ControllerError::NotRunning),
        };
        self.report(instance, result);
    }

    fn stop(&mut self, instance: &str) {
        match self.controllers.remove(instance) {
            Some(mut controller) => controller.stop(),
            None => debug!(instance, "Unknown instance, ignoring stop command"),
        }
    }

    fn stop_all(&mut self) {
        for (_, mut controller) in self.controllers.drain() {
            controller.stop();
        }
    }

    fn report(&self, instance: &str, result: Result<(), ControllerError>) {
        if let Err(e) = result {
            warn!(instance, "Command failed: {}", e);
            Emitter::new(instance, self.event_tx.clone()).fatal(RelayError::from(&e));
        }
    }

    fn send_event(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
