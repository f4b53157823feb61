//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur while running the subprocess encoder.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Extra arguments could not be parsed.
    #[error("Invalid encoder arguments: {0}")]
    InvalidArgs(String),

    /// The encoder process could not be launched.
    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The audio input could not be prepared.
    #[error("Audio input setup failed: {0}")]
    AudioInput(#[source] std::io::Error),

    /// Crash recovery gave up.
    #[error("Encoder failed: {0}")]
    Fatal(String),
}
