//! Byte-order correction and frame packaging.

use bytes::BytesMut;

use crate::error::CaptureError;
use crate::frame::{PixelFormat, RawVideoFrame, VideoFrame};
use crate::CaptureResult;

/// Swaps the red and blue channel of every 4-byte pixel in place.
///
/// The buffer is left untouched if it is not made of whole pixels.
pub fn swap_red_blue(buf: &mut [u8]) -> CaptureResult<()> {
    if buf.len() % PixelFormat::BYTES_PER_PIXEL != 0 {
        return Err(CaptureError::Misaligned(buf.len()));
    }
    for pixel in buf.chunks_exact_mut(PixelFormat::BYTES_PER_PIXEL) {
        pixel.swap(0, 2);
    }
    Ok(())
}

/// Converts a raw host frame into the layout a sink expects.
///
/// When the layouts already match the pixel data is shared, not copied.
pub fn convert_frame(
    raw: &RawVideoFrame,
    source: PixelFormat,
    target: PixelFormat,
    timecode: u64,
    frame_rate: u32,
) -> CaptureResult<VideoFrame> {
    if raw.width == 0 || raw.height == 0 {
        return Err(CaptureError::InvalidDimensions {
            width: raw.width,
            height: raw.height,
        });
    }

    let expected = RawVideoFrame::expected_len(raw.width, raw.height);
    if raw.data.len() != expected {
        return Err(CaptureError::MalformedVideo {
            expected,
            actual: raw.data.len(),
        });
    }

    let data = if source == target {
        raw.data.clone()
    } else {
        let mut buf = BytesMut::from(&raw.data[..]);
        swap_red_blue(&mut buf)?;
        buf.freeze()
    };

    Ok(VideoFrame {
        width: raw.width,
        height: raw.height,
        timecode,
        frame_rate_n: frame_rate * 1000,
        frame_rate_d: 1000,
        aspect_ratio: raw.aspect_ratio,
        format: target,
        stride: raw.width * PixelFormat::BYTES_PER_PIXEL as u32,
        data,
    })
}
