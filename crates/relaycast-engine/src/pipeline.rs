//! Per-instance conversion and dispatch loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use relaycast_audio::{AudioPipeline, Pcm, SampleFormat};
use relaycast_capture::{
    convert_frame, make_preview, AudioChunk, FrameSkipper, HostChannels, PixelFormat,
    RawVideoFrame, TimecodeClock, AUDIO_CHANNEL_CAPACITY, FRAME_CHANNEL_CAPACITY,
};
use relaycast_encoder::SubprocessSink;
use relaycast_ipc::{EngineEvent, InstanceConfig, MediaType, RelayError, SharedState};
use relaycast_transport::{NetworkSink, TALLY_POLL_INTERVAL};

use crate::events::Emitter;
use crate::rate::{LiveOutputs, RateState};
use crate::stats::{RateCounter, WeightedAverage};

/// Configuration cell replaced wholesale on reconfiguration.
pub type SharedConfig = Arc<RwLock<Arc<InstanceConfig>>>;

/// Timing and queue limits of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTimings {
    /// Time given to in-flight work after the instance stops accepting.
    pub drain: Duration,

    /// Time the host gets to close before teardown is forced.
    pub host_stop_grace: Duration,

    /// Interval between two network tally polls.
    pub tally_poll_interval: Duration,

    /// Captured frames waiting for the pipeline.
    pub frame_queue: usize,

    /// Audio container chunks waiting for the pipeline.
    pub audio_queue: usize,

    /// Deferred frames or audio blocks per media type while a delay offset is set.
    pub delay_queue: usize,

    /// Bucket length of the rate counters.
    pub rate_bucket: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            drain: Duration::from_millis(100),
            host_stop_grace: Duration::from_secs(1),
            tally_poll_interval: TALLY_POLL_INTERVAL,
            frame_queue: FRAME_CHANNEL_CAPACITY,
            audio_queue: AUDIO_CHANNEL_CAPACITY,
            delay_queue: 512,
            rate_bucket: Duration::from_secs(1),
        }
    }
}

/// A running encoder together with the input layout it was launched with.
#[derive(Clone)]
pub(crate) struct EncoderSlot {
    pub sink: Arc<SubprocessSink>,
    pub width: u32,
    pub height: u32,
    pub video: bool,
    pub audio: bool,
}

/// Sinks of one instance, swapped by the controller and read by the pipeline.
#[derive(Default)]
pub(crate) struct SinkSet {
    pub network: RwLock<Option<NetworkSink>>,
    pub encoder: RwLock<Option<EncoderSlot>>,
}

impl SinkSet {
    fn encoder(&self) -> Option<EncoderSlot> {
        self.encoder.read().clone()
    }

    fn has_network(&self) -> bool {
        self.network.read().is_some()
    }

    /// Sinks that can currently take frames. An encoder that failed stays in
    /// its slot until the instance stops but no longer counts.
    pub fn live(&self) -> LiveOutputs {
        LiveOutputs {
            network: self.has_network(),
            encoder: self
                .encoder
                .read()
                .as_ref()
                .is_some_and(|slot| slot.sink.is_accepting()),
        }
    }
}

/// Events held back by a delay offset, in arrival order.
struct DelayQueue<T> {
    items: VecDeque<(Instant, T)>,
    capacity: usize,
}

impl<T> DelayQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queues an item; never releases it before an earlier one.
    /// Returns false if the oldest item had to be dropped.
    fn push(&mut self, due: Instant, item: T) -> bool {
        let due = match self.items.back() {
            Some((last, _)) if *last > due => *last,
            _ => due,
        };
        let mut kept = true;
        if self.items.len() == self.capacity {
            self.items.pop_front();
            kept = false;
        }
        self.items.push_back((due, item));
        kept
    }

    fn next_due(&self) -> Option<Instant> {
        self.items.front().map(|(due, _)| *due)
    }

    fn pop_due(&mut self, now: Instant) -> Option<T> {
        match self.items.front() {
            Some((due, _)) if *due <= now => self.items.pop_front().map(|(_, item)| item),
            _ => None,
        }
    }
}

/// Latency and rate bookkeeping of one media type.
struct MediaStats {
    media: MediaType,
    fps: u32,
    latency: WeightedAverage,
    rate: RateCounter,
}

impl MediaStats {
    fn new(media: MediaType, fps: u32, bucket: Duration) -> Self {
        Self {
            media,
            fps,
            latency: WeightedAverage::for_rate(fps),
            rate: RateCounter::new(bucket),
        }
    }

    /// Resizes the latency window when the configured rate changed.
    fn retune(&mut self, fps: u32) {
        if fps != self.fps {
            debug!(media = ?self.media, fps, "Statistics window resized");
            self.fps = fps;
            self.latency = WeightedAverage::for_rate(fps);
        }
    }
}

/// A decoded audio block waiting for its delay to pass.
struct DecodedBlock {
    pcm: Pcm,
    decode_time: Duration,
}

/// Converts host frames and audio into sink frames for one instance.
///
/// Runs as a single task on the instance runtime; each frame or chunk is
/// processed to completion before the next one is taken. Every audio chunk
/// reaches the demuxer whether or not a sink wants audio, so the container
/// position is never lost; delays and drops apply to decoded blocks.
pub(crate) struct Pipeline {
    frames: Option<mpsc::Receiver<RawVideoFrame>>,
    chunks: Option<mpsc::Receiver<AudioChunk>>,
    state: SharedState,
    config: SharedConfig,
    sinks: Arc<SinkSet>,
    rates: Arc<RateState>,
    emitter: Emitter,
    host_format: PixelFormat,
    clock: TimecodeClock,
    skipper: FrameSkipper,
    audio: AudioPipeline,
    video_delay: DelayQueue<RawVideoFrame>,
    audio_delay: DelayQueue<DecodedBlock>,
    video_stats: MediaStats,
    audio_stats: MediaStats,
    origin: Instant,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: HostChannels,
        state: SharedState,
        config: SharedConfig,
        sinks: Arc<SinkSet>,
        rates: Arc<RateState>,
        emitter: Emitter,
        host_format: PixelFormat,
        timings: &PipelineTimings,
    ) -> Self {
        let initial = config.read().clone();
        Self {
            frames: Some(channels.frames),
            chunks: Some(channels.audio),
            state,
            sinks,
            skipper: FrameSkipper::new(rates.source(), rates.target()),
            rates,
            emitter,
            host_format,
            clock: TimecodeClock::system(),
            audio: AudioPipeline::new(initial.sample_rate, initial.channels),
            video_delay: DelayQueue::new(timings.delay_queue),
            audio_delay: DelayQueue::new(timings.delay_queue),
            video_stats: MediaStats::new(MediaType::Video, initial.frame_rate, timings.rate_bucket),
            audio_stats: MediaStats::new(MediaType::Audio, initial.frame_rate, timings.rate_bucket),
            origin: Instant::now(),
            config,
        }
    }

    /// Processes host input until both channels are closed.
    pub async fn run(mut self) {
        debug!(instance = %self.emitter.instance(), "Pipeline started");

        while self.frames.is_some() || self.chunks.is_some() {
            let due = earliest(self.video_delay.next_due(), self.audio_delay.next_due());
            let wake = due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                chunk = recv(&mut self.chunks), if self.chunks.is_some() => match chunk {
                    Some(chunk) => self.accept_audio(chunk),
                    None => self.chunks = None,
                },
                frame = recv(&mut self.frames), if self.frames.is_some() => match frame {
                    Some(frame) => self.accept_video(frame),
                    None => self.frames = None,
                },
                _ = sleep_until(wake), if due.is_some() => self.release_due(),
            }
        }

        debug!(instance = %self.emitter.instance(), "Pipeline exited");
    }

    fn accept_video(&mut self, frame: RawVideoFrame) {
        if !self.state.is_accepting() {
            return;
        }

        let delay = self.config.read().video_delay_ms;
        if delay == 0 && self.video_delay.is_empty() {
            self.process_video(frame);
        } else {
            let due = Instant::now() + Duration::from_millis(delay);
            if !self.video_delay.push(due, frame) {
                warn!("Video delay queue full, oldest frame dropped");
            }
        }
    }

    /// Feeds a container chunk to the demuxer and dispatches or defers the
    /// decoded blocks.
    fn accept_audio(&mut self, chunk: AudioChunk) {
        if !self.state.is_accepting() {
            return;
        }

        let config = self.config.read().clone();
        if chunk.discontinuity {
            self.audio.resync();
        }
        self.audio.set_layout(config.sample_rate, config.channels);

        let blocks = self.audio.feed(&chunk.data);
        let wanted = config.channels > 0
            && (self.sinks.has_network() || self.sinks.encoder().is_some_and(|slot| slot.audio));
        if !wanted {
            trace!(blocks = blocks.len(), "No audio sink, blocks discarded");
            return;
        }

        for block in blocks {
            let started = Instant::now();
            let pcm = match self.audio.decode(&block) {
                Ok(pcm) => pcm,
                Err(e) => {
                    warn!("{}", RelayError::MalformedAudio(e.to_string()));
                    continue;
                }
            };
            let decoded = DecodedBlock {
                pcm,
                decode_time: started.elapsed(),
            };

            if config.audio_delay_ms == 0 && self.audio_delay.is_empty() {
                self.process_audio(decoded);
            } else {
                let due = Instant::now() + Duration::from_millis(config.audio_delay_ms);
                if !self.audio_delay.push(due, decoded) {
                    warn!("Audio delay queue full, oldest block dropped");
                }
            }
        }
    }

    fn release_due(&mut self) {
        let now = Instant::now();
        while let Some(frame) = self.video_delay.pop_due(now) {
            self.process_video(frame);
        }
        while let Some(block) = self.audio_delay.pop_due(now) {
            self.process_audio(block);
        }
    }

    fn process_video(&mut self, raw: RawVideoFrame) {
        if !self.state.is_accepting() {
            trace!("Instance stopping, frame discarded");
            return;
        }

        let config = self.config.read().clone();
        let started = Instant::now();

        let expected = RawVideoFrame::expected_len(raw.width, raw.height);
        if raw.width == 0 || raw.height == 0 || raw.data.len() != expected {
            let error = RelayError::MalformedVideo(format!(
                "{}x{} frame carries {} bytes, expected {}",
                raw.width,
                raw.height,
                raw.data.len(),
                expected
            ));
            warn!("{}", error);
            return;
        }

        if config.preview {
            self.send_preview(&raw);
        }

        self.skipper.set_rates(self.rates.source(), self.rates.target());
        if !self.skipper.should_forward() {
            trace!("Frame skipped");
            return;
        }

        let timecode = self.clock.next();

        {
            let network = self.sinks.network.read();
            if let Some(sink) = network.as_ref() {
                match convert_frame(&raw, self.host_format, PixelFormat::Bgra, timecode, config.frame_rate) {
                    Ok(frame) => {
                        sink.video(frame);
                    }
                    Err(e) => warn!("{}", RelayError::MalformedVideo(e.to_string())),
                }
            }
        }

        if let Some(slot) = self.sinks.encoder().filter(|slot| slot.video) {
            if raw.width != slot.width || raw.height != slot.height {
                debug!(
                    "Frame {}x{} does not match encoder input {}x{}, not written",
                    raw.width, raw.height, slot.width, slot.height
                );
            } else {
                match convert_frame(&raw, self.host_format, PixelFormat::Rgba, timecode, config.frame_rate) {
                    Ok(frame) => {
                        slot.sink.video(&frame);
                    }
                    Err(e) => warn!("{}", RelayError::MalformedVideo(e.to_string())),
                }
            }
        }

        self.video_stats.retune(config.frame_rate);
        self.record(MediaType::Video, started.elapsed(), 1);
    }

    fn process_audio(&mut self, block: DecodedBlock) {
        if !self.state.is_accepting() {
            trace!("Instance stopping, audio discarded");
            return;
        }

        let started = Instant::now();
        let timecode = self.clock.next();
        let pcm = &block.pcm;

        if self.sinks.has_network() {
            match self.audio.frame(pcm, SampleFormat::F32Planar, timecode) {
                Ok(frame) => {
                    if let Some(sink) = self.sinks.network.read().as_ref() {
                        sink.audio(frame);
                    }
                }
                Err(e) => warn!("{}", RelayError::MalformedAudio(e.to_string())),
            }
        }

        if let Some(slot) = self.sinks.encoder().filter(|slot| slot.audio) {
            match self.audio.frame(pcm, SampleFormat::S16Interleaved, timecode) {
                Ok(frame) => {
                    slot.sink.audio(&frame);
                }
                Err(e) => warn!("{}", RelayError::MalformedAudio(e.to_string())),
            }
        }

        let frame_rate = self.config.read().frame_rate;
        self.audio_stats.retune(frame_rate);
        self.record(MediaType::Audio, block.decode_time + started.elapsed(), pcm.frames() as u64);
    }

    fn send_preview(&self, raw: &RawVideoFrame) {
        match make_preview(raw, self.host_format) {
            Ok(preview) => self.emitter.send(EngineEvent::Preview {
                instance: self.emitter.instance().to_string(),
                width: preview.width,
                height: preview.height,
                data: preview.data,
            }),
            Err(e) => debug!("Preview skipped: {}", e),
        }
    }

    fn record(&mut self, media: MediaType, latency: Duration, count: u64) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let stats = match media {
            MediaType::Video => &mut self.video_stats,
            MediaType::Audio => &mut self.audio_stats,
        };

        if let Some(latency) = stats.latency.record(latency_ms) {
            self.emitter.send(EngineEvent::Statistics {
                instance: self.emitter.instance().to_string(),
                media: stats.media,
                stats: latency,
            });
        }
        if let Some(per_second) = stats.rate.record_n(count, now_ms) {
            self.emitter.send(EngineEvent::Rate {
                instance: self.emitter.instance().to_string(),
                media: stats.media,
                per_second,
            });
        }
    }
}

async fn recv<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiopus::coder::Encoder;
    use audiopus::{Application, Bitrate, Channels, SampleRate};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use relaycast_audio::AudioFrame;
    use relaycast_capture::{CaptureInput, VideoFrame};
    use relaycast_ipc::InstanceState;
    use relaycast_transport::{AvSender, AvTransport, TallyFlags, TransportResult};

    #[derive(Default)]
    struct Received {
        video: Mutex<Vec<VideoFrame>>,
        audio: Mutex<Vec<AudioFrame>>,
    }

    struct FakeTransport(Arc<Received>);

    struct FakeSender(Arc<Received>);

    impl AvTransport for FakeTransport {
        fn is_supported(&self) -> bool {
            true
        }

        fn create_sender(&self, _name: &str) -> TransportResult<Box<dyn AvSender>> {
            Ok(Box::new(FakeSender(self.0.clone())))
        }
    }

    impl AvSender for FakeSender {
        fn send_video(&mut self, frame: &VideoFrame) -> TransportResult<()> {
            self.0.video.lock().push(frame.clone());
            Ok(())
        }

        fn send_audio(&mut self, frame: &AudioFrame) -> TransportResult<()> {
            self.0.audio.lock().push(frame.clone());
            Ok(())
        }

        fn poll_tally(&mut self) -> TallyFlags {
            TallyFlags::default()
        }
    }

    struct Harness {
        pipeline: Pipeline,
        state: SharedState,
        config: SharedConfig,
        events: crossbeam_channel::Receiver<EngineEvent>,
        received: Arc<Received>,
        _input: CaptureInput,
    }

    fn harness(config: InstanceConfig, host_format: PixelFormat) -> Harness {
        let (event_tx, events) = crossbeam_channel::unbounded();
        let state = SharedState::new();
        state.set(InstanceState::Running);
        let (input, channels) = CaptureInput::channel(state.clone(), 4, 4);

        let received = Arc::new(Received::default());
        let mut network = NetworkSink::new("test");
        network
            .start(&FakeTransport(received.clone()), Arc::new(|_| {}))
            .unwrap();
        let sinks = Arc::new(SinkSet::default());
        *sinks.network.write() = Some(network);

        let rates = Arc::new(RateState::new());
        rates.store(config.frame_rate, config.frame_rate);

        let config: SharedConfig = Arc::new(RwLock::new(Arc::new(config)));
        let pipeline = Pipeline::new(
            channels,
            state.clone(),
            Arc::clone(&config),
            sinks,
            rates,
            Emitter::new("test", event_tx),
            host_format,
            &PipelineTimings::default(),
        );

        Harness {
            pipeline,
            state,
            config,
            events,
            received,
            _input: input,
        }
    }

    fn config() -> InstanceConfig {
        InstanceConfig {
            title: "Show".to_string(),
            source: "https://example.com".to_string(),
            width: 2,
            height: 1,
            frame_rate: 1,
            network: true,
            ..Default::default()
        }
    }

    fn raw() -> RawVideoFrame {
        RawVideoFrame::new(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]), 2, 1)
    }

    async fn wait_for_video(received: &Received, count: usize) -> bool {
        for _ in 0..200 {
            if received.video.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    async fn wait_for_audio(received: &Received, count: usize) -> bool {
        for _ in 0..200 {
            if received.audio.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn element(id: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        if body.len() < 0x7F {
            out.push(0x80 | body.len() as u8);
        } else {
            assert!(body.len() < 0x3FFF);
            out.push(0x40 | (body.len() >> 8) as u8);
            out.push(body.len() as u8);
        }
        out.extend_from_slice(body);
        out
    }

    /// Container header up to the first cluster, as the recorder emits it.
    fn container_header() -> Vec<u8> {
        let mut out = element(&[0x1A, 0x45, 0xDF, 0xA3], &[0x42, 0x86, 0x81, 0x01]);
        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        out.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0xFF]);
        out.extend(element(&[0xE7], &[0x00]));
        out
    }

    /// One SimpleBlock per 20 ms stereo Opus packet.
    fn opus_blocks(count: usize) -> Vec<Vec<u8>> {
        let mut encoder =
            Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio).unwrap();
        encoder.set_bitrate(Bitrate::BitsPerSecond(16_000)).unwrap();
        let mut packet = vec![0u8; 4000];
        (0..count)
            .map(|i| {
                let pcm: Vec<i16> = (0..960 * 2).map(|n| ((n + i * 7) % 64) as i16 * 32).collect();
                let len = encoder.encode(&pcm, &mut packet).unwrap();
                let mut body = vec![0x81, 0x00, 0x00, 0x80];
                body.extend_from_slice(&packet[..len]);
                element(&[0xA3], &body)
            })
            .collect()
    }

    fn chunk(data: Vec<u8>, discontinuity: bool) -> AudioChunk {
        AudioChunk {
            data: Bytes::from(data),
            discontinuity,
        }
    }

    #[tokio::test]
    async fn test_network_receives_bgra() {
        let mut h = harness(config(), PixelFormat::Rgba);
        h.pipeline.process_video(raw());

        assert!(wait_for_video(&h.received, 1).await);
        let frame = h.received.video.lock()[0].clone();
        assert_eq!(frame.format, PixelFormat::Bgra);
        assert_eq!(&frame.data[..], &[3, 2, 1, 4, 7, 6, 5, 8]);
        assert_eq!(frame.stride, 8);
        assert_eq!(frame.frame_rate_n, 1000);

        // One sample per second at 1 fps: statistics follow every frame.
        let stats = h
            .events
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::Statistics { media: MediaType::Video, .. }))
            .count();
        assert_eq!(stats, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped() {
        let mut h = harness(config(), PixelFormat::Bgra);
        h.pipeline
            .process_video(RawVideoFrame::new(Bytes::from_static(&[0; 7]), 2, 1));
        h.pipeline.process_video(raw());

        assert!(wait_for_video(&h.received, 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.received.video.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stopping_discards_frames() {
        let mut h = harness(config(), PixelFormat::Bgra);
        h.state.set(InstanceState::Stopping);
        h.pipeline.process_video(raw());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.received.video.lock().is_empty());
    }

    #[tokio::test]
    async fn test_zero_target_forwards_nothing() {
        let mut h = harness(config(), PixelFormat::Bgra);
        h.pipeline.rates.store(60, 0);
        for _ in 0..5 {
            h.pipeline.process_video(raw());
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.received.video.lock().is_empty());
    }

    #[tokio::test]
    async fn test_preview_event() {
        let config = InstanceConfig {
            preview: true,
            ..config()
        };
        let mut h = harness(config, PixelFormat::Bgra);
        h.pipeline.process_video(raw());

        let preview = h
            .events
            .try_iter()
            .find(|e| matches!(e, EngineEvent::Preview { .. }));
        match preview {
            Some(EngineEvent::Preview { width, height, data, .. }) => {
                assert_eq!((width, height), (128, 72));
                assert_eq!(data.len(), 128 * 72 * 4);
            }
            other => panic!("expected preview, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_audio_stream_reaches_network() {
        let mut h = harness(config(), PixelFormat::Bgra);
        let mut stream = container_header();
        stream.extend(opus_blocks(3).concat());
        h.pipeline.accept_audio(chunk(stream, false));

        assert!(wait_for_audio(&h.received, 3).await);
        let frame = h.received.audio.lock()[0].clone();
        assert_eq!(frame.format, SampleFormat::F32Planar);
        assert_eq!((frame.sample_rate, frame.channels, frame.samples), (48_000, 2, 960));
    }

    #[tokio::test]
    async fn test_audio_delay_holds_decoded_blocks() {
        let mut h = harness(
            InstanceConfig {
                audio_delay_ms: 40,
                ..config()
            },
            PixelFormat::Bgra,
        );
        let mut stream = container_header();
        stream.extend(opus_blocks(3).concat());
        h.pipeline.accept_audio(chunk(stream, false));

        // Blocks are demuxed and decoded on arrival, only delivery waits.
        assert_eq!(h.pipeline.audio.blocks(), 3);
        assert!(h.pipeline.audio_delay.next_due().is_some());
        h.pipeline.release_due();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.received.audio.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        h.pipeline.release_due();
        assert!(wait_for_audio(&h.received, 3).await);
        assert!(h.pipeline.audio_delay.is_empty());
    }

    #[tokio::test]
    async fn test_audio_without_sink_keeps_demuxer_position() {
        let mut h = harness(config(), PixelFormat::Bgra);
        let network = h.pipeline.sinks.network.write().take();

        let blocks = opus_blocks(4);
        let mut first = container_header();
        first.extend_from_slice(&blocks[0]);
        first.extend_from_slice(&blocks[1][..3]);
        h.pipeline.accept_audio(chunk(first, false));
        assert_eq!(h.pipeline.audio.blocks(), 1);

        *h.pipeline.sinks.network.write() = network;
        let mut rest = blocks[1][3..].to_vec();
        rest.extend(blocks[2..].concat());
        h.pipeline.accept_audio(chunk(rest, false));

        assert_eq!(h.pipeline.audio.blocks(), 4);
        assert!(wait_for_audio(&h.received, 3).await);
    }

    #[tokio::test]
    async fn test_audio_gap_recovers_following_blocks() {
        let mut h = harness(config(), PixelFormat::Bgra);
        h.pipeline.accept_audio(chunk(container_header(), false));

        let blocks = opus_blocks(10);
        for (i, block) in blocks.into_iter().enumerate() {
            match i {
                3 => continue,
                4 => h.pipeline.accept_audio(chunk(block, true)),
                _ => h.pipeline.accept_audio(chunk(block, false)),
            }
        }

        // The block after the gap is confirmed by the one following it.
        assert_eq!(h.pipeline.audio.blocks(), 9);
        assert!(wait_for_audio(&h.received, 9).await);
    }

    #[tokio::test]
    async fn test_layout_change_mid_stream() {
        let mut h = harness(config(), PixelFormat::Bgra);
        let blocks = opus_blocks(4);

        let mut first = container_header();
        first.extend(blocks[..2].concat());
        first.extend_from_slice(&blocks[2][..5]);
        h.pipeline.accept_audio(chunk(first, false));
        assert!(wait_for_audio(&h.received, 2).await);

        let mono = InstanceConfig {
            channels: 1,
            ..(**h.config.read()).clone()
        };
        *h.config.write() = Arc::new(mono);

        let mut rest = blocks[2][5..].to_vec();
        rest.extend_from_slice(&blocks[3]);
        h.pipeline.accept_audio(chunk(rest, false));

        assert_eq!(h.pipeline.audio.blocks(), 4);
        assert!(wait_for_audio(&h.received, 4).await);
        let channels: Vec<u16> = h.received.audio.lock().iter().map(|f| f.channels).collect();
        assert_eq!(channels, vec![2, 2, 1, 1]);
    }

    #[tokio::test]
    async fn test_statistics_window_follows_frame_rate() {
        let mut h = harness(config(), PixelFormat::Bgra);
        h.pipeline.process_video(raw());
        assert_eq!(h.pipeline.video_stats.fps, 1);

        let faster = InstanceConfig {
            frame_rate: 4,
            ..config()
        };
        *h.config.write() = Arc::new(faster);
        h.pipeline.rates.store(4, 4);
        for _ in 0..3 {
            h.pipeline.process_video(raw());
        }
        assert_eq!(h.pipeline.video_stats.fps, 4);
        // Four samples per report at 4 fps: nothing yet since the resize.
        let _ = h.events.try_iter().count();
        h.pipeline.process_video(raw());
        let stats = h
            .events
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::Statistics { media: MediaType::Video, .. }))
            .count();
        assert_eq!(stats, 1);
    }

    #[test]
    fn test_delay_queue_keeps_order() {
        let mut queue = DelayQueue::new(2);
        let now = Instant::now();
        assert!(queue.push(now + Duration::from_millis(50), 1));
        // A shorter delay never overtakes a queued item.
        assert!(queue.push(now, 2));
        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.pop_due(now + Duration::from_millis(50)), Some(1));
        assert_eq!(queue.pop_due(now + Duration::from_millis(50)), Some(2));

        assert!(queue.push(now, 3));
        assert!(queue.push(now, 4));
        assert!(!queue.push(now, 5));
        assert_eq!(queue.pop_due(now), Some(4));
    }
}
