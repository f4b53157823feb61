//! Lifecycle and capture-rate control of one instance.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use relaycast_capture::{CaptureInput, CaptureMethod, ForceClose, HostChannels, RenderHost};
use relaycast_encoder::{FatalCallback, SubprocessParams, SubprocessSink};
use relaycast_ipc::{
    EngineEvent, InstanceConfig, InstanceId, InstanceState, LifecycleEvent, RelayError,
    SharedState, SinkKind, StartupPhase, Tally,
};
use relaycast_transport::{AvTransport, NetworkSink, TallyCallback};

use crate::error::ControllerError;
use crate::events::Emitter;
use crate::pipeline::{EncoderSlot, Pipeline, PipelineTimings, SharedConfig, SinkSet};
use crate::rate::{paint_rate, select_method, target_rate, AdaptiveRatePolicy, RateState};
use crate::{ControllerResult, RUNTIME_SHUTDOWN_TIMEOUT};

type SharedHost = Arc<Mutex<Box<dyn RenderHost>>>;

/// Recomputes the capture rate from configuration, live sinks and tally.
#[derive(Clone)]
struct RateControl {
    host: SharedHost,
    config: SharedConfig,
    sinks: Arc<SinkSet>,
    state: SharedState,
    rates: Arc<RateState>,
    tally: Arc<RwLock<Tally>>,
    policy: AdaptiveRatePolicy,
}

impl RateControl {
    /// Applies the target rate to the host. Without `force` nothing happens
    /// unless the target differs from the active one.
    fn update(&self, force: bool) {
        let config = self.config.read().clone();
        let tally = *self.tally.read();
        let target = target_rate(&config, self.sinks.live(), tally, &self.policy);
        if !force && target == self.rates.target() {
            return;
        }

        let source = {
            let mut host = self.host.lock();
            match select_method(&config) {
                CaptureMethod::Subscription => host.refresh_rate(),
                CaptureMethod::Paint => {
                    let rate = paint_rate(target);
                    host.set_capture_rate(rate);
                    rate
                }
            }
        };

        self.rates.store(source, target);
        info!(rate = target, source, tally = tally.name(), "Capture rate applied");
    }

    fn on_tally(&self, tally: Tally, emitter: &Emitter) {
        *self.tally.write() = tally;
        info!(instance = %emitter.instance(), tally = tally.name(), "Tally changed");
        emitter.send(EngineEvent::Tally {
            instance: emitter.instance().to_string(),
            tally,
        });

        if self.state.is_accepting() {
            self.update(false);
        }
    }
}

/// Drives one capture instance from start to stop.
///
/// Owns the rendering host, the sinks and a single-worker runtime on which
/// the conversion pipeline and all sink writes run.
pub struct CaptureController {
    emitter: Emitter,
    state: SharedState,
    config: SharedConfig,
    host: SharedHost,
    transport: Arc<dyn AvTransport>,
    sinks: Arc<SinkSet>,
    control: RateControl,
    timings: PipelineTimings,
    runtime: Option<Runtime>,
    pipeline: Option<JoinHandle<()>>,
    force_close: Option<ForceClose>,
}

impl CaptureController {
    /// Create an idle controller.
    pub fn new(
        instance: impl Into<InstanceId>,
        host: Box<dyn RenderHost>,
        transport: Arc<dyn AvTransport>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let state = SharedState::new();
        let config: SharedConfig = Arc::new(RwLock::new(Arc::new(InstanceConfig::default())));
        let host: SharedHost = Arc::new(Mutex::new(host));
        let sinks = Arc::new(SinkSet::default());

        let control = RateControl {
            host: Arc::clone(&host),
            config: Arc::clone(&config),
            sinks: Arc::clone(&sinks),
            state: state.clone(),
            rates: Arc::new(RateState::new()),
            tally: Arc::new(RwLock::new(Tally::Unconnected)),
            policy: AdaptiveRatePolicy::default(),
        };

        Self {
            emitter: Emitter::new(instance, event_tx),
            state,
            config,
            host,
            transport,
            sinks,
            control,
            timings: PipelineTimings::default(),
            runtime: None,
            pipeline: None,
            force_close: None,
        }
    }

    pub fn with_policy(mut self, policy: AdaptiveRatePolicy) -> Self {
        self.control.policy = policy;
        self
    }

    pub fn with_timings(mut self, timings: PipelineTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn instance(&self) -> &str {
        self.emitter.instance()
    }

    pub fn state(&self) -> InstanceState {
        self.state.get()
    }

    /// The active configuration, with unavailable sinks switched off.
    pub fn config(&self) -> Arc<InstanceConfig> {
        self.config.read().clone()
    }

    pub fn tally(&self) -> Tally {
        *self.control.tally.read()
    }

    /// Frames per second currently forwarded to the sinks.
    pub fn target_rate(&self) -> u32 {
        self.control.rates.target()
    }

    /// Starts the instance.
    ///
    /// Every failure after the `Starting` event rolls back what was started
    /// and is reported as a `Failed` event as well as returned.
    #[instrument(name = "instance_start", skip(self, config), fields(instance = %self.emitter.instance()))]
    pub fn start(&mut self, config: InstanceConfig) -> ControllerResult<()> {
        if !self.state.get().is_idle() {
            return Err(ControllerError::AlreadyRunning);
        }

        info!("Starting instance");
        self.emitter.lifecycle(LifecycleEvent::Starting);

        match self.run_startup(config) {
            Ok(()) => {
                self.state.set(InstanceState::Running);
                self.emitter.lifecycle(LifecycleEvent::Started);
                info!("Instance started");
                Ok(())
            }
            Err(e) => {
                error!("Instance start failed: {}", e);
                self.state.set(InstanceState::Idle);
                self.emitter.lifecycle(LifecycleEvent::Failed {
                    error: RelayError::from(&e),
                });
                Err(e)
            }
        }
    }

    fn run_startup(&mut self, config: InstanceConfig) -> ControllerResult<()> {
        config.validate()?;

        *self.config.write() = Arc::new(config);
        *self.control.tally.write() = Tally::Unconnected;
        self.control.rates.store(0, 0);
        self.state.set(InstanceState::Starting);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("relaycast-{}", self.emitter.instance()))
            .enable_all()
            .build()
            .map_err(ControllerError::Runtime)?;
        self.runtime = Some(runtime);

        let (input, channels) = CaptureInput::channel(
            self.state.clone(),
            self.timings.frame_queue,
            self.timings.audio_queue,
        );
        let mut channels = Some(channels);

        let mut phase = StartupPhase::FIRST;
        loop {
            debug!(phase = phase.name(), "Startup phase");

            let result = match phase {
                StartupPhase::StartNetwork => self.start_network(),
                StartupPhase::StartEncoder => self.start_encoder(),
                StartupPhase::StartPipeline => match channels.take() {
                    Some(channels) => self.start_pipeline(channels),
                    None => Ok(()),
                },
                StartupPhase::LoadHost => self.load_host(input.clone()),
            };

            if let Err(e) = result {
                self.rollback(phase);
                return Err(e);
            }

            match phase.next() {
                Some(next) => phase = next,
                None => return Ok(()),
            }
        }
    }

    fn start_network(&self) -> ControllerResult<()> {
        let config = self.config.read().clone();
        if !config.network {
            return Ok(());
        }

        let mut sink = NetworkSink::new(config.title.clone())
            .with_poll_interval(self.timings.tally_poll_interval);

        let control = self.control.clone();
        let emitter = self.emitter.clone();
        let on_tally: TallyCallback = Arc::new(move |tally| control.on_tally(tally, &emitter));

        match sink.start(self.transport.as_ref(), on_tally) {
            Ok(()) => {
                *self.sinks.network.write() = Some(sink);
                Ok(())
            }
            Err(e) => self.degrade(SinkKind::Network, e.to_string()),
        }
    }

    fn start_encoder(&self) -> ControllerResult<()> {
        let config = self.config.read().clone();
        if !config.subprocess {
            return Ok(());
        }

        let params = SubprocessParams::from(config.as_ref());
        let (width, height, video, audio) = (params.width, params.height, params.video, params.audio);

        let emitter = self.emitter.clone();
        let control = self.control.clone();
        let on_fatal: FatalCallback = Arc::new(move |message| {
            error!(instance = %emitter.instance(), "Encoder failed: {}", message);
            emitter.fatal(RelayError::FatalSink {
                sink: SinkKind::Subprocess,
                message,
            });
            // The failed encoder no longer counts as a consumer.
            if control.state.is_accepting() {
                control.update(false);
            }
        });

        let runtime = self.runtime.as_ref().ok_or(ControllerError::NotRunning)?;
        match runtime.block_on(SubprocessSink::start(params, on_fatal)) {
            Ok(sink) => {
                *self.sinks.encoder.write() = Some(EncoderSlot {
                    sink: Arc::new(sink),
                    width,
                    height,
                    video,
                    audio,
                });
                Ok(())
            }
            Err(e) => self.degrade(SinkKind::Subprocess, e.to_string()),
        }
    }

    /// Continues without a sink that could not be started, as long as some
    /// other output remains.
    fn degrade(&self, sink: SinkKind, message: String) -> ControllerResult<()> {
        warn!("{} sink unavailable: {}", sink.name(), message);

        let mut config = (**self.config.read()).clone();
        match sink {
            SinkKind::Network => config.network = false,
            SinkKind::Subprocess => config.subprocess = false,
        }
        if !config.display && !config.consumes_frames() {
            return Err(ControllerError::SinkUnavailable { sink, message });
        }

        *self.config.write() = Arc::new(config);
        self.emitter
            .fatal(RelayError::SinkUnavailable { sink, message });
        Ok(())
    }

    fn start_pipeline(&mut self, channels: HostChannels) -> ControllerResult<()> {
        let host_format = self.host.lock().pixel_format();
        let pipeline = Pipeline::new(
            channels,
            self.state.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.sinks),
            Arc::clone(&self.control.rates),
            self.emitter.clone(),
            host_format,
            &self.timings,
        );

        let runtime = self.runtime.as_ref().ok_or(ControllerError::NotRunning)?;
        self.pipeline = Some(runtime.spawn(pipeline.run()));
        Ok(())
    }

    fn load_host(&mut self, input: CaptureInput) -> ControllerResult<()> {
        let config = self.config.read().clone();
        let method = select_method(&config);
        debug!(?method, "Capture method selected");

        {
            let mut host = self.host.lock();
            host.set_capture_method(method);
            host.set_audio_muted(config.host_audio_muted());
            self.force_close = host.force_close_handle();
        }
        self.control.update(true);

        if !self.host.lock().load(&config, input) {
            return Err(ControllerError::HostLoadFailed(config.source.clone()));
        }
        Ok(())
    }

    /// Undoes `failed` and every phase before it.
    fn rollback(&mut self, failed: StartupPhase) {
        let mut phase = Some(failed);
        while let Some(current) = phase {
            debug!(phase = current.name(), "Rolling back");
            match current {
                StartupPhase::LoadHost => {
                    self.force_close = None;
                    self.host.lock().stop(false);
                }
                StartupPhase::StartPipeline => self.stop_pipeline(),
                StartupPhase::StartEncoder => self.stop_encoder(),
                StartupPhase::StartNetwork => self.stop_network(),
            }
            phase = current.previous();
        }
        self.shutdown_runtime();
    }

    /// Replaces the configuration.
    ///
    /// A running instance keeps its sinks unless a sink was switched on or
    /// off; method and rate changes are applied to the host in place.
    #[instrument(name = "instance_reconfigure", skip(self, config), fields(instance = %self.emitter.instance()))]
    pub fn reconfigure(&mut self, config: InstanceConfig) -> ControllerResult<()> {
        config.validate()?;

        let previous = self.config.read().clone();
        *self.config.write() = Arc::new(config);

        if !self.state.get().is_running() {
            debug!("Configuration replaced while not running");
            return Ok(());
        }
        info!("Reconfiguring instance");

        let current = self.config.read().clone();
        if previous.network != current.network {
            if current.network {
                self.start_network()?;
            } else {
                self.stop_network();
                *self.control.tally.write() = Tally::Unconnected;
            }
        }
        if previous.subprocess != current.subprocess {
            if current.subprocess {
                self.start_encoder()?;
            } else {
                self.stop_encoder();
            }
        }

        let current = self.config.read().clone();
        let method = select_method(&current);
        let method_changed = method != select_method(&previous);
        {
            let mut host = self.host.lock();
            host.reconfigure(&current);
            if method_changed {
                debug!(?method, "Capture method changed");
                host.set_capture_method(method);
            }
            host.set_audio_muted(current.host_audio_muted());
        }
        self.control.update(method_changed);

        Ok(())
    }

    /// Reloads the content of a running instance.
    #[instrument(name = "instance_reload", skip(self), fields(instance = %self.emitter.instance()))]
    pub fn reload(&mut self) -> ControllerResult<()> {
        if !self.state.get().is_running() {
            return Err(ControllerError::NotRunning);
        }

        self.emitter.lifecycle(LifecycleEvent::Reloading);
        self.host.lock().reload();
        self.emitter.lifecycle(LifecycleEvent::Reloaded);
        info!("Instance reloaded");
        Ok(())
    }

    /// Stops the instance. Does nothing unless it is starting or running.
    #[instrument(name = "instance_stop", skip(self), fields(instance = %self.emitter.instance()))]
    pub fn stop(&mut self) {
        if !self.state.get().is_accepting() {
            debug!("Already idle or stopping, ignoring stop");
            return;
        }

        info!("Stopping instance");
        self.state.set(InstanceState::Stopping);
        self.emitter.lifecycle(LifecycleEvent::Stopping);

        // In-flight work finishes; new work is already rejected.
        thread::sleep(self.timings.drain);

        self.stop_host();
        self.stop_pipeline();
        self.stop_network();
        self.stop_encoder();
        self.shutdown_runtime();

        *self.control.tally.write() = Tally::Unconnected;
        self.control.rates.store(0, 0);
        self.state.set(InstanceState::Idle);
        self.emitter.lifecycle(LifecycleEvent::Stopped);
        info!("Instance stopped");
    }

    /// Closes the host gracefully. After the grace period the host's forced
    /// teardown runs without waiting for the host lock; a host that has none,
    /// or that still does not return, is abandoned.
    fn stop_host(&mut self) {
        let force_close = self.force_close.take();
        let grace = self.timings.host_stop_grace;
        let host = Arc::clone(&self.host);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let spawned = thread::Builder::new()
            .name(format!("relaycast-{}-host-stop", self.emitter.instance()))
            .spawn(move || {
                host.lock().stop(true);
                let _ = done_tx.send(());
            });

        if let Err(e) = spawned {
            warn!("Failed to spawn host stop thread: {}", e);
            self.host.lock().stop(false);
            return;
        }
        if done_rx.recv_timeout(grace).is_ok() {
            return;
        }

        warn!("Host did not close within {:?}, forcing teardown", grace);
        match force_close {
            Some(force_close) => {
                force_close();
                if done_rx.recv_timeout(grace).is_err() {
                    error!("Host still closing after forced teardown, abandoned");
                }
            }
            None => error!("Host cannot be torn down, abandoned"),
        }
    }

    fn stop_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
    }

    fn stop_network(&self) {
        let sink = self.sinks.network.write().take();
        if let Some(mut sink) = sink {
            sink.stop();
        }
    }

    fn stop_encoder(&self) {
        let slot = self.sinks.encoder.write().take();
        if let (Some(slot), Some(runtime)) = (slot, self.runtime.as_ref()) {
            runtime.block_on(slot.sink.stop());
        }
    }

    fn shutdown_runtime(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.stop();
    }
}
