//! Preview thumbnails for the operator UI.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};

use crate::convert::swap_red_blue;
use crate::error::CaptureError;
use crate::frame::{PixelFormat, RawVideoFrame};
use crate::CaptureResult;

/// Thumbnail width in pixels.
pub const PREVIEW_WIDTH: u32 = 128;

/// Thumbnail height in pixels.
pub const PREVIEW_HEIGHT: u32 = 72;

/// A downscaled RGBA thumbnail.
#[derive(Debug, Clone)]
pub struct Preview {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Downscales a raw frame to a bilinear-filtered RGBA thumbnail.
pub fn make_preview(raw: &RawVideoFrame, source: PixelFormat) -> CaptureResult<Preview> {
    let expected = RawVideoFrame::expected_len(raw.width, raw.height);
    if raw.width == 0 || raw.height == 0 || raw.data.len() != expected {
        return Err(CaptureError::MalformedVideo {
            expected,
            actual: raw.data.len(),
        });
    }

    let image: ImageBuffer<Rgba<u8>, &[u8]> =
        ImageBuffer::from_raw(raw.width, raw.height, &raw.data[..]).ok_or(
            CaptureError::MalformedVideo {
                expected,
                actual: raw.data.len(),
            },
        )?;

    let resized = imageops::resize(&image, PREVIEW_WIDTH, PREVIEW_HEIGHT, FilterType::Triangle);
    let mut data = resized.into_raw();
    if source == PixelFormat::Bgra {
        swap_red_blue(&mut data)?;
    }

    Ok(Preview {
        width: PREVIEW_WIDTH,
        height: PREVIEW_HEIGHT,
        data,
    })
}
