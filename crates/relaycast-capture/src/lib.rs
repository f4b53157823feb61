//! Frame intake from the rendering host and video conversion.
//!
//! This crate defines the rendering-host seam, the raw and output video frame
//! types, the per-instance timecode clock, frame-skip bookkeeping and the
//! byte-order conversion applied before frames reach a sink.

mod convert;
mod error;
mod frame;
mod host;
mod preview;
mod skip;
mod timecode;

pub use convert::{convert_frame, swap_red_blue};
pub use error::CaptureError;
pub use frame::{PixelFormat, RawVideoFrame, VideoFrame};
pub use host::{AudioChunk, CaptureInput, CaptureMethod, ForceClose, HostChannels, RenderHost};
pub use preview::{make_preview, Preview, PREVIEW_HEIGHT, PREVIEW_WIDTH};
pub use skip::FrameSkipper;
pub use timecode::{ClockSource, SystemClock, TimecodeClock};

/// Captured frames waiting to be converted.
pub const FRAME_CHANNEL_CAPACITY: usize = 16;

/// Audio container chunks waiting for the demuxer. Sized for several
/// seconds of recorder output.
pub const AUDIO_CHANNEL_CAPACITY: usize = 256;

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
