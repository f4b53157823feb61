//! Network AV sink.
//!
//! This crate wraps a send-capable AV-over-network library behind the
//! [`AvTransport`] and [`AvSender`] traits and provides the [`NetworkSink`]
//! that hands frames to it, polls receiver presence and derives the tally.

mod error;
mod sink;
mod tally;

pub use error::TransportError;
pub use sink::{NetworkSink, SinkStatistics, TallyCallback};
pub use tally::{TallyFlags, TallyTracker};

use std::time::Duration;

use relaycast_audio::AudioFrame;
use relaycast_capture::VideoFrame;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Interval between two tally polls.
pub const TALLY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Frames waiting for the sender thread, per media type.
pub const SEND_SLOT_CAPACITY: usize = 1;

/// An AV-over-network library.
pub trait AvTransport: Send + Sync {
    /// Returns false if the library cannot run on this host (CPU, platform).
    fn is_supported(&self) -> bool;

    /// Opens a named sender.
    fn create_sender(&self, name: &str) -> TransportResult<Box<dyn AvSender>>;
}

/// An open, named network sender.
pub trait AvSender: Send {
    /// Sends one BGRA video frame.
    fn send_video(&mut self, frame: &VideoFrame) -> TransportResult<()>;

    /// Sends one planar float32 audio frame.
    fn send_audio(&mut self, frame: &AudioFrame) -> TransportResult<()>;

    /// Reads the receiver count and program/preview flags.
    fn poll_tally(&mut self) -> TallyFlags;
}
