//! Rendering-host seam.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use relaycast_ipc::{InstanceConfig, SharedState};

use crate::frame::{PixelFormat, RawVideoFrame};

/// How the host delivers frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMethod {
    /// Subscribe to every presented frame; the rate follows the display
    /// refresh rate and surplus frames are skipped by counting.
    Subscription,

    /// Hook the paint path; the host renders at the requested rate.
    Paint,
}

/// Forced teardown callable without access to the host.
pub type ForceClose = Arc<dyn Fn() + Send + Sync>;

/// A chunk of the streamed audio container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,

    /// Set when chunks before this one were dropped; the demuxer has to
    /// find its way back into the stream.
    pub discontinuity: bool,
}

/// Receiving ends of the host channels, owned by the pipeline.
#[derive(Debug)]
pub struct HostChannels {
    pub frames: mpsc::Receiver<RawVideoFrame>,
    pub audio: mpsc::Receiver<AudioChunk>,
}

/// Handle through which the host pushes frames and audio.
///
/// Frames and audio travel on separate channels so a burst of frames never
/// costs container bytes. Both are rejected once the instance stops
/// accepting work. A frame is dropped when the pipeline is not keeping up;
/// a dropped audio chunk marks the next one as a discontinuity.
#[derive(Debug, Clone)]
pub struct CaptureInput {
    frames: mpsc::Sender<RawVideoFrame>,
    audio: mpsc::Sender<AudioChunk>,
    state: SharedState,
    audio_gap: Arc<AtomicBool>,
    dropped_frames: Arc<AtomicU64>,
    dropped_chunks: Arc<AtomicU64>,
}

impl CaptureInput {
    /// Creates the input handle and the pipeline's receiving ends.
    pub fn channel(state: SharedState, frame_capacity: usize, audio_capacity: usize) -> (Self, HostChannels) {
        let (frames_tx, frames) = mpsc::channel(frame_capacity.max(1));
        let (audio_tx, audio) = mpsc::channel(audio_capacity.max(1));
        let input = Self {
            frames: frames_tx,
            audio: audio_tx,
            state,
            audio_gap: Arc::new(AtomicBool::new(false)),
            dropped_frames: Arc::new(AtomicU64::new(0)),
            dropped_chunks: Arc::new(AtomicU64::new(0)),
        };
        (input, HostChannels { frames, audio })
    }

    /// Pushes a captured frame. Returns false if it was not accepted.
    pub fn capture_frame(&self, frame: RawVideoFrame) -> bool {
        if !self.state.is_accepting() {
            return false;
        }

        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(dropped, "Pipeline busy, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Pushes a chunk of the audio container. Returns false if it was not accepted.
    pub fn audio_chunk(&self, data: Bytes) -> bool {
        if !self.state.is_accepting() {
            return false;
        }

        let discontinuity = self.audio_gap.load(Ordering::Acquire);
        match self.audio.try_send(AudioChunk { data, discontinuity }) {
            Ok(()) => {
                if discontinuity {
                    self.audio_gap.store(false, Ordering::Release);
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                self.audio_gap.store(true, Ordering::Release);
                let dropped = self.dropped_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Audio pipeline busy, container chunk dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Number of frames dropped because the pipeline was busy.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Number of audio chunks dropped because the pipeline was busy.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

/// The rendering host that displays content and produces raw frames and an
/// audio container for one instance.
pub trait RenderHost: Send {
    /// Loads the configured content and starts pushing into `input`.
    /// Returns false if the content failed to load.
    fn load(&mut self, config: &InstanceConfig, input: CaptureInput) -> bool;

    /// Refresh rate of the display the host presents on.
    fn refresh_rate(&self) -> u32;

    /// Pixel layout of the frames the host pushes.
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::native()
    }

    /// Selects how frames are delivered.
    fn set_capture_method(&mut self, method: CaptureMethod);

    /// Sets the paint rate (ignored by subscription capture).
    fn set_capture_rate(&mut self, rate: u32);

    /// Mutes or unmutes page audio locally.
    fn set_audio_muted(&mut self, _muted: bool) {}

    /// Applies a replaced configuration (geometry, visibility).
    fn reconfigure(&mut self, _config: &InstanceConfig) {}

    /// Reloads the content.
    fn reload(&mut self);

    /// Closes the content. `graceful` is false on forced teardown.
    fn stop(&mut self, graceful: bool);

    /// Handle that tears the content down from another thread while a
    /// graceful `stop` still holds the host. Hosts without one are abandoned
    /// when they do not close in time.
    fn force_close_handle(&self) -> Option<ForceClose> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_ipc::InstanceState;

    fn chunk(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[test]
    fn test_rejects_when_not_accepting() {
        let state = SharedState::new();
        let (input, mut channels) = CaptureInput::channel(state.clone(), 2, 2);

        assert!(!input.audio_chunk(chunk(b"x")));

        state.set(InstanceState::Running);
        assert!(input.audio_chunk(chunk(b"x")));
        assert_eq!(
            channels.audio.try_recv().ok(),
            Some(AudioChunk {
                data: chunk(b"x"),
                discontinuity: false
            })
        );

        state.set(InstanceState::Stopping);
        assert!(!input.capture_frame(RawVideoFrame::new(Bytes::new(), 0, 0)));
    }

    #[test]
    fn test_frames_do_not_displace_audio() {
        let state = SharedState::new();
        state.set(InstanceState::Running);
        let (input, mut channels) = CaptureInput::channel(state, 1, 4);

        assert!(input.capture_frame(RawVideoFrame::new(Bytes::new(), 0, 0)));
        assert!(!input.capture_frame(RawVideoFrame::new(Bytes::new(), 0, 0)));
        assert_eq!(input.dropped_frames(), 1);

        assert!(input.audio_chunk(chunk(b"a")));
        assert!(input.audio_chunk(chunk(b"b")));
        assert_eq!(input.dropped_chunks(), 0);
        assert_eq!(channels.audio.try_recv().map(|c| c.data).ok(), Some(chunk(b"a")));
        assert!(channels.frames.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_chunk_marks_discontinuity() {
        let state = SharedState::new();
        state.set(InstanceState::Running);
        let (input, mut channels) = CaptureInput::channel(state, 1, 1);

        assert!(input.audio_chunk(chunk(b"a")));
        assert!(!input.audio_chunk(chunk(b"b")));
        assert_eq!(input.dropped_chunks(), 1);

        assert!(!channels.audio.try_recv().unwrap().discontinuity);
        assert!(input.audio_chunk(chunk(b"c")));
        let next = channels.audio.try_recv().unwrap();
        assert_eq!(next.data, chunk(b"c"));
        assert!(next.discontinuity);

        assert!(input.audio_chunk(chunk(b"d")));
        assert!(!channels.audio.try_recv().unwrap().discontinuity);
    }
}
