//! Bitrate and rate-control policy.

use relaycast_ipc::RateControlMode;

/// Quality factor used by `vbr`.
pub const VBR_CRF: u32 = 23;

/// Anchor of the reference model: 1920x1080 at 30 fps needs 6000 kbps.
const REFERENCE_PIXELS: f64 = 1920.0 * 1080.0;
const REFERENCE_FPS: f64 = 30.0;
const REFERENCE_KBPS: f64 = 6000.0;

/// Bits per pixel of uncompressed 4:2:0 video.
const RAW_BITS_PER_PIXEL: f64 = 12.0;

/// Compression ratio assumed by the simple model.
const COMPRESSION_RATIO: f64 = 100.0;

/// Motion rank (1 low, 2 medium, 4 high) and constant of the Kush gauge.
const MOTION_RANK: f64 = 2.0;
const KUSH_CONSTANT: f64 = 0.07;

const WEIGHT_COMPRESSION: f64 = 0.2;
const WEIGHT_KUSH: f64 = 0.3;
const WEIGHT_REFERENCE: f64 = 0.5;

const ROUNDING_KBPS: f64 = 50.0;
const MIN_KBPS: u32 = 100;

/// Encoder rate-control parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    /// Mode the parameters were derived for.
    pub mode: RateControlMode,

    /// Target bitrate in kbps; `None` for quality-targeted encoding.
    pub bitrate_kbps: Option<u32>,

    /// Command-line arguments expressing the parameters.
    pub args: Vec<String>,
}

/// Estimates the video bitrate for a geometry and frame rate.
///
/// Blends a compression-ratio model, the Kush gauge and a model anchored at
/// 1080p30, then rounds to the nearest 50 kbps.
pub fn compute_bitrate_kbps(width: u32, height: u32, fps: u32) -> u32 {
    let pixels = f64::from(width) * f64::from(height);
    let fps = f64::from(fps.max(1));

    let compression = pixels * fps * RAW_BITS_PER_PIXEL / COMPRESSION_RATIO / 1000.0;
    let kush = pixels * fps * MOTION_RANK * KUSH_CONSTANT / 1000.0;
    let reference = REFERENCE_KBPS * (pixels / REFERENCE_PIXELS) * (fps / REFERENCE_FPS).sqrt();

    let blended =
        WEIGHT_COMPRESSION * compression + WEIGHT_KUSH * kush + WEIGHT_REFERENCE * reference;
    let rounded = (blended / ROUNDING_KBPS).round() * ROUNDING_KBPS;

    (rounded as u32).max(MIN_KBPS)
}

/// Derives encoder parameters for a geometry, frame rate and mode.
pub fn encoder_params(width: u32, height: u32, fps: u32, mode: RateControlMode) -> EncoderParams {
    let kbps = |value: u32| format!("{value}k");

    match mode {
        RateControlMode::Vbr => EncoderParams {
            mode,
            bitrate_kbps: None,
            args: vec!["-crf".to_string(), VBR_CRF.to_string()],
        },
        RateControlMode::Abr => {
            let bitrate = compute_bitrate_kbps(width, height, fps);
            EncoderParams {
                mode,
                bitrate_kbps: Some(bitrate),
                args: vec![
                    "-b:v".to_string(),
                    kbps(bitrate),
                    "-minrate".to_string(),
                    kbps(bitrate / 2),
                    "-maxrate".to_string(),
                    kbps(bitrate * 3 / 2),
                    "-bufsize".to_string(),
                    kbps(bitrate * 2),
                ],
            }
        }
        RateControlMode::Cbr => {
            let bitrate = compute_bitrate_kbps(width, height, fps);
            EncoderParams {
                mode,
                bitrate_kbps: Some(bitrate),
                args: vec![
                    "-b:v".to_string(),
                    kbps(bitrate),
                    "-minrate".to_string(),
                    kbps(bitrate),
                    "-maxrate".to_string(),
                    kbps(bitrate),
                    "-bufsize".to_string(),
                    kbps(bitrate),
                ],
            }
        }
    }
}
