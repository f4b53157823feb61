//! Error types for the audio module.

use thiserror::Error;

/// Errors that can occur while turning the audio container into frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    /// The container stream could not be parsed; the demuxer was reset.
    #[error("Malformed audio container: {0}")]
    MalformedContainer(String),

    /// A frame payload does not match its announced layout.
    #[error("Malformed audio: expected {expected} bytes, got {actual}")]
    MalformedAudio { expected: usize, actual: usize },

    /// The decoder rejected a block or could not be created.
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Unsupported sample rate or channel count.
    #[error("Unsupported audio format: {0}")]
    Unsupported(String),
}
