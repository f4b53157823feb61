//! Network sink with a dedicated sender thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace, warn};

use relaycast_audio::AudioFrame;
use relaycast_capture::VideoFrame;
use relaycast_ipc::Tally;

use crate::error::TransportError;
use crate::tally::TallyTracker;
use crate::{AvSender, AvTransport, TransportResult, SEND_SLOT_CAPACITY, TALLY_POLL_INTERVAL};

/// Called on every tally transition.
pub type TallyCallback = Arc<dyn Fn(Tally) + Send + Sync>;

/// Delivery statistics of a network sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatistics {
    pub video_sent: u64,
    pub audio_sent: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    video_sent: AtomicU64,
    audio_sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Latest-wins hand-off slot for one media type.
struct Slot<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(SEND_SLOT_CAPACITY);
        Self { tx, rx }
    }

    /// Offers a frame, evicting the one still waiting. Returns false if a
    /// frame was dropped.
    fn offer(&self, frame: T) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(frame);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Delivers frames to a named network sender and tracks its tally.
///
/// Frames are handed to a sender thread; one that is still waiting when the
/// next arrives is dropped, never queued.
pub struct NetworkSink {
    name: String,
    poll_interval: Duration,
    should_stop: Arc<AtomicBool>,
    video: Option<Slot<VideoFrame>>,
    audio: Option<Slot<AudioFrame>>,
    thread: Option<JoinHandle<()>>,
    tally: Arc<RwLock<Tally>>,
    counters: Arc<Counters>,
}

impl NetworkSink {
    /// Create a sink for the sender `name`; nothing is opened yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: TALLY_POLL_INTERVAL,
            should_stop: Arc::new(AtomicBool::new(false)),
            video: None,
            audio: None,
            thread: None,
            tally: Arc::new(RwLock::new(Tally::Unconnected)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Overrides the tally poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Opens the sender and starts the sender thread.
    ///
    /// Support is checked before anything else is touched.
    #[instrument(name = "network_sink_start", skip_all, fields(name = %self.name))]
    pub fn start(&mut self, transport: &dyn AvTransport, on_tally: TallyCallback) -> TransportResult<()> {
        if self.thread.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        if !transport.is_supported() {
            return Err(TransportError::Unsupported);
        }

        let sender = transport.create_sender(&self.name)?;

        let video = Slot::new();
        let audio = Slot::new();
        let video_rx = video.rx.clone();
        let audio_rx = audio.rx.clone();

        self.should_stop.store(false, Ordering::SeqCst);
        let should_stop = Arc::clone(&self.should_stop);
        let tally = Arc::clone(&self.tally);
        let counters = Arc::clone(&self.counters);
        let poll_interval = self.poll_interval;

        let thread = std::thread::Builder::new()
            .name(format!("network-sink-{}", self.name))
            .spawn(move || {
                run_sender(
                    sender,
                    video_rx,
                    audio_rx,
                    should_stop,
                    tally,
                    on_tally,
                    counters,
                    poll_interval,
                )
            })
            .map_err(TransportError::Thread)?;

        self.video = Some(video);
        self.audio = Some(audio);
        self.thread = Some(thread);

        info!("Network sender started");
        Ok(())
    }

    /// Returns true while the sender thread runs.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Hands a BGRA frame to the sender. Returns false if a frame was dropped.
    pub fn video(&self, frame: VideoFrame) -> bool {
        let Some(slot) = &self.video else {
            return false;
        };
        let delivered = slot.offer(frame);
        if !delivered {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Network video frame dropped");
        }
        delivered
    }

    /// Hands a planar float32 frame to the sender. Returns false if a frame was dropped.
    pub fn audio(&self, frame: AudioFrame) -> bool {
        let Some(slot) = &self.audio else {
            return false;
        };
        let delivered = slot.offer(frame);
        if !delivered {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Network audio frame dropped");
        }
        delivered
    }

    /// Last tally derived from the transport.
    pub fn tally(&self) -> Tally {
        *self.tally.read()
    }

    pub fn statistics(&self) -> SinkStatistics {
        SinkStatistics {
            video_sent: self.counters.video_sent.load(Ordering::Relaxed),
            audio_sent: self.counters.audio_sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Tears the sender down. Safe to call if `start` never completed.
    #[instrument(name = "network_sink_stop", skip(self), fields(name = %self.name))]
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);

        // Dropping the slots disconnects the sender thread.
        self.video = None;
        self.audio = None;

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Network sender thread panicked");
            }
            info!("Network sender stopped");
        }
        *self.tally.write() = Tally::Unconnected;
    }
}

impl Drop for NetworkSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_sender(
    mut sender: Box<dyn AvSender>,
    video_rx: Receiver<VideoFrame>,
    audio_rx: Receiver<AudioFrame>,
    should_stop: Arc<AtomicBool>,
    tally: Arc<RwLock<Tally>>,
    on_tally: TallyCallback,
    counters: Arc<Counters>,
    poll_interval: Duration,
) {
    let mut tracker = TallyTracker::new();
    let mut last_poll: Option<Instant> = None;

    debug!("Network sender loop started");

    while !should_stop.load(Ordering::SeqCst) {
        if last_poll.map_or(true, |t| t.elapsed() >= poll_interval) {
            if let Some(next) = tracker.update(sender.poll_tally()) {
                debug!(tally = next.name(), "Tally changed");
                *tally.write() = next;
                on_tally(next);
            }
            last_poll = Some(Instant::now());
        }

        select! {
            recv(video_rx) -> msg => match msg {
                Ok(frame) => match sender.send_video(&frame) {
                    Ok(()) => {
                        counters.video_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Network video send failed: {}", e);
                    }
                },
                Err(_) => break,
            },
            recv(audio_rx) -> msg => match msg {
                Ok(frame) => match sender.send_audio(&frame) {
                    Ok(()) => {
                        counters.audio_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Network audio send failed: {}", e);
                    }
                },
                Err(_) => break,
            },
            default(poll_interval) => {}
        }
    }

    debug!("Network sender loop exited");
}
