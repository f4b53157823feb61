//! Pure sample layout conversions.

use bytes::{BufMut, Bytes, BytesMut};

/// Re-lays out interleaved samples from `from` to `to` channels.
///
/// Mono fans out to every channel, a downmix to mono averages all channels,
/// other changes keep the leading channels and fill the rest with silence.
pub fn remix(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    let (from, to) = (usize::from(from), usize::from(to));
    if from == to || from == 0 || to == 0 {
        return if from == to { samples.to_vec() } else { Vec::new() };
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            out.push((sum / from as i32) as i16);
            continue;
        }
        for channel in 0..to {
            let sample = if channel < from {
                frame[channel]
            } else if from == 1 {
                frame[0]
            } else {
                0
            };
            out.push(sample);
        }
    }
    out
}

/// Converts interleaved signed 16-bit samples to planar little-endian float32.
///
/// The output holds `channels` planes of `4 * samples` bytes each.
pub fn interleaved_to_planar_f32(samples: &[i16], channels: u16) -> Bytes {
    let channels = usize::from(channels);
    if channels == 0 {
        return Bytes::new();
    }

    let frames = samples.len() / channels;
    let mut out = BytesMut::with_capacity(frames * channels * 4);
    for channel in 0..channels {
        for frame in samples.chunks_exact(channels) {
            out.put_f32_le(f32::from(frame[channel]) / 32768.0);
        }
    }
    out.freeze()
}

/// Serializes interleaved signed 16-bit samples as little-endian bytes.
pub fn s16_to_le_bytes(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.put_i16_le(sample);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_layout() {
        // Two frames of stereo: L0 R0 L1 R1.
        let planar = interleaved_to_planar_f32(&[16384, -16384, 0, 32767], 2);
        let values: Vec<f32> = planar
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values, vec![0.5, 0.0, -0.5, 32767.0 / 32768.0]);
    }

    #[test]
    fn test_remix_mono_to_stereo_and_back() {
        let stereo = remix(&[100, -200], 1, 2);
        assert_eq!(stereo, vec![100, 100, -200, -200]);
        assert_eq!(remix(&[100, 300, -10, 10], 2, 1), vec![200, 0]);
    }

    #[test]
    fn test_remix_stereo_to_surround_pads_silence() {
        assert_eq!(remix(&[1, 2], 2, 6), vec![1, 2, 0, 0, 0, 0]);
        assert_eq!(remix(&[1, 2, 3, 4, 5, 6], 6, 2), vec![1, 2]);
    }

    #[test]
    fn test_s16_bytes() {
        assert_eq!(&s16_to_le_bytes(&[1, -1])[..], &[1, 0, 0xFF, 0xFF]);
    }
}
