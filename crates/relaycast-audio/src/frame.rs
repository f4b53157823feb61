//! Output audio frame type.

use bytes::Bytes;

use crate::error::AudioError;
use crate::pcm::{interleaved_to_planar_f32, s16_to_le_bytes};
use crate::AudioResult;

/// Sample layout of an audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian, channels interleaved.
    S16Interleaved,

    /// 32-bit float little-endian, one plane per channel.
    F32Planar,
}

impl SampleFormat {
    /// Bytes per single-channel sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Interleaved => 2,
            Self::F32Planar => 4,
        }
    }
}

/// A formatted, timestamped audio frame ready for a sink.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count.
    pub channels: u16,

    /// Samples per channel.
    pub samples: usize,

    /// Bytes per channel plane (planar) or per sample frame (interleaved).
    pub stride: usize,

    /// Sample layout of `data`.
    pub format: SampleFormat,

    /// Monotonic timecode in nanoseconds.
    pub timecode: u64,

    /// Sample data.
    pub data: Bytes,
}

impl AudioFrame {
    /// Packages a payload, deriving the sample count from its length.
    ///
    /// Fails unless `data.len() == channels * bytes_per_sample * samples`.
    pub fn new(
        data: Bytes,
        format: SampleFormat,
        sample_rate: u32,
        channels: u16,
        timecode: u64,
    ) -> AudioResult<Self> {
        if channels == 0 {
            return Err(AudioError::Unsupported("zero channels".to_string()));
        }

        let bps = format.bytes_per_sample();
        let per_frame = usize::from(channels) * bps;
        let samples = data.len() / per_frame;
        if samples * per_frame != data.len() {
            return Err(AudioError::MalformedAudio {
                expected: samples * per_frame,
                actual: data.len(),
            });
        }

        let stride = match format {
            SampleFormat::F32Planar => samples * bps,
            SampleFormat::S16Interleaved => per_frame,
        };

        Ok(Self {
            sample_rate,
            channels,
            samples,
            stride,
            format,
            timecode,
            data,
        })
    }

    /// Builds a frame from interleaved 16-bit PCM in the requested layout.
    pub fn from_pcm(
        samples: &[i16],
        format: SampleFormat,
        sample_rate: u32,
        channels: u16,
        timecode: u64,
    ) -> AudioResult<Self> {
        let data = match format {
            SampleFormat::F32Planar => interleaved_to_planar_f32(samples, channels),
            SampleFormat::S16Interleaved => s16_to_le_bytes(samples),
        };
        let frame = Self::new(data, format, sample_rate, channels, timecode)?;

        let expected = samples.len() / usize::from(channels);
        if frame.samples != expected || samples.len() % usize::from(channels) != 0 {
            return Err(AudioError::MalformedAudio {
                expected: samples.len() * format.bytes_per_sample(),
                actual: frame.data.len(),
            });
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_sizes_for_all_shapes() {
        for &n in &[0usize, 1, 480, 4800] {
            for &c in &[1u16, 2, 6] {
                let interleaved: Vec<i16> = (0..n * usize::from(c))
                    .map(|i| (i % 65_536) as i16)
                    .collect();
                let frame =
                    AudioFrame::from_pcm(&interleaved, SampleFormat::F32Planar, 48_000, c, 7)
                        .unwrap();

                assert_eq!(frame.samples, n, "n={n} c={c}");
                assert_eq!(frame.stride, 4 * n, "n={n} c={c}");
                assert_eq!(frame.data.len(), usize::from(c) * 4 * n, "n={n} c={c}");
            }
        }
    }

    #[test]
    fn test_interleaved_stride() {
        let frame =
            AudioFrame::from_pcm(&[0; 960 * 2], SampleFormat::S16Interleaved, 48_000, 2, 0).unwrap();
        assert_eq!(frame.samples, 960);
        assert_eq!(frame.stride, 4);
        assert_eq!(frame.data.len(), 3840);
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let err = AudioFrame::new(
            Bytes::from_static(&[0; 10]),
            SampleFormat::F32Planar,
            48_000,
            2,
            0,
        )
        .unwrap_err();
        assert_eq!(err, AudioError::MalformedAudio { expected: 8, actual: 10 });

        assert!(AudioFrame::from_pcm(&[1, 2, 3], SampleFormat::S16Interleaved, 48_000, 2, 0).is_err());
    }
}
