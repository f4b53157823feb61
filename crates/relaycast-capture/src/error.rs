//! Error types for the capture module.

use thiserror::Error;

/// Errors that can occur while converting captured frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// Pixel buffer does not match the announced geometry.
    #[error("Malformed video frame: expected {expected} bytes, got {actual}")]
    MalformedVideo { expected: usize, actual: usize },

    /// Pixel buffer is not made of whole 4-byte pixels.
    #[error("Pixel buffer of {0} bytes is not 4-byte aligned")]
    Misaligned(usize),

    /// Frame has a zero dimension.
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}
