//! Audio decode and convert pipeline.
//!
//! The rendering host streams page audio as a WebM container carrying Opus.
//! This crate splits that stream into compressed blocks as bytes arrive,
//! decodes them to linear PCM and lays samples out the way each sink wants.

mod decoder;
mod demux;
mod error;
mod frame;
mod pcm;
mod pipeline;

pub use decoder::OpusBlockDecoder;
pub use demux::BlockDemuxer;
pub use error::AudioError;
pub use frame::{AudioFrame, SampleFormat};
pub use pcm::{interleaved_to_planar_f32, remix, s16_to_le_bytes};
pub use pipeline::{AudioPipeline, Pcm};

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;

/// Largest Opus frame per channel (120 ms at 48 kHz).
pub const MAX_FRAME_SAMPLES: usize = 5760;
