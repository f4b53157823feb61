//! Opus block decoder.

use audiopus::coder::Decoder;
use audiopus::{Channels, SampleRate};
use tracing::debug;

use crate::error::AudioError;
use crate::{AudioResult, MAX_FRAME_SAMPLES};

/// Decodes Opus blocks to interleaved signed 16-bit PCM.
pub struct OpusBlockDecoder {
    decoder: Decoder,
    channels: u16,
    sample_rate: u32,
    buf: Vec<i16>,
}

// SAFETY: the libopus decoder state is owned exclusively by this wrapper and
// only touched through `&mut self`.
unsafe impl Send for OpusBlockDecoder {}

impl OpusBlockDecoder {
    /// Creates a decoder producing `channels` (1 or 2) at `sample_rate`.
    pub fn new(sample_rate: u32, channels: u16) -> AudioResult<Self> {
        let rate = match sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(AudioError::Unsupported(format!(
                    "sample rate {other} Hz"
                )))
            }
        };
        let layout = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(AudioError::Unsupported(format!("{other} decode channels"))),
        };

        let decoder = Decoder::new(rate, layout)
            .map_err(|e| AudioError::Decoder(format!("Failed to create Opus decoder: {e:?}")))?;

        debug!(sample_rate, channels, "Opus decoder created");

        Ok(Self {
            decoder,
            channels,
            sample_rate,
            buf: vec![0; MAX_FRAME_SAMPLES * usize::from(channels)],
        })
    }

    /// Channels produced per sample frame.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decodes one block; returns interleaved samples.
    pub fn decode(&mut self, block: &[u8]) -> AudioResult<&[i16]> {
        let decoded = self
            .decoder
            .decode(Some(block), &mut self.buf, false)
            .map_err(|e| AudioError::Decoder(format!("Opus decoding failed: {e:?}")))?;

        Ok(&self.buf[..decoded * usize::from(self.channels)])
    }
}

impl std::fmt::Debug for OpusBlockDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpusBlockDecoder")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}
