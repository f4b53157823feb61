//! Bitrate policy and the subprocess encoder sink.
//!
//! This crate derives encoder parameters from geometry and rate-control mode,
//! builds the encoder command line and supervises the encoder process,
//! including its one-shot fallback after an illegal-instruction crash.

mod args;
mod error;
mod policy;
mod process;
mod supervisor;

pub use args::{split_args, FfmpegArgsBuilder};
pub use error::EncoderError;
pub use policy::{compute_bitrate_kbps, encoder_params, EncoderParams};
pub use process::{FatalCallback, SinkCounters, SubprocessParams, SubprocessSink};
pub use supervisor::{locate_alternate, CrashSupervisor, ExitKind, RecoveryAction};

use std::time::Duration;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// Bound on a single write to an encoder input.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Time the encoder gets to exit after the termination signal.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Time the encoder gets to connect to its audio input before the missing
/// connection is reported.
pub const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per encoder input while a write is in progress.
pub const INPUT_QUEUE_CAPACITY: usize = 8;
