//! Raw and output video frame types.

use bytes::Bytes;

/// Byte order of a 32-bit pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Blue, green, red, alpha.
    Bgra,

    /// Red, green, blue, alpha.
    Rgba,
}

impl PixelFormat {
    /// Bytes per pixel for both supported layouts.
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Layout the rendering host produces on this platform.
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Bgra
        } else {
            Self::Rgba
        }
    }

    /// Returns the four-character tag used by sinks.
    pub fn fourcc(self) -> &'static str {
        match self {
            Self::Bgra => "BGRA",
            Self::Rgba => "RGBA",
        }
    }
}

/// A pixel buffer pushed by the rendering host.
///
/// Consumed exactly once by the video conversion step.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    /// Pixel data in the host's native layout.
    pub data: Bytes,

    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Whether the frame carries changed content.
    pub dirty: bool,

    /// Display aspect ratio.
    pub aspect_ratio: f32,
}

impl RawVideoFrame {
    /// Create a new raw frame with a square-pixel aspect ratio.
    pub fn new(data: Bytes, width: u32, height: u32) -> Self {
        let aspect_ratio = if height == 0 {
            0.0
        } else {
            width as f32 / height as f32
        };

        Self {
            data,
            width,
            height,
            dirty: true,
            aspect_ratio,
        }
    }

    /// Expected buffer length for a 32-bit frame of the given size.
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * PixelFormat::BYTES_PER_PIXEL
    }
}

/// A formatted, timestamped video frame ready for a sink.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Monotonic timecode in nanoseconds.
    pub timecode: u64,

    /// Frame-rate numerator.
    pub frame_rate_n: u32,

    /// Frame-rate denominator.
    pub frame_rate_d: u32,

    /// Display aspect ratio.
    pub aspect_ratio: f32,

    /// Pixel layout of `data`.
    pub format: PixelFormat,

    /// Bytes per row.
    pub stride: u32,

    /// Pixel data.
    pub data: Bytes,
}

impl VideoFrame {
    /// Timecode in 100 ns units, as network AV protocols expect.
    pub fn timecode_100ns(&self) -> u64 {
        self.timecode / 100
    }
}
