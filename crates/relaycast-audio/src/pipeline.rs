//! Per-instance audio decode and convert pipeline.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::decoder::OpusBlockDecoder;
use crate::demux::BlockDemuxer;
use crate::error::AudioError;
use crate::frame::{AudioFrame, SampleFormat};
use crate::pcm::remix;
use crate::AudioResult;

/// Decoded interleaved 16-bit PCM at the instance's channel count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pcm {
    pub samples: Vec<i16>,
    pub channels: u16,
}

impl Pcm {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / usize::from(self.channels)
        }
    }
}

/// Turns the host's audio container stream into sink-ready frames.
///
/// The demuxer lives as long as the pipeline and sees every chunk the host
/// delivered. The decoder is created on the first block and reused until the
/// layout changes.
#[derive(Debug)]
pub struct AudioPipeline {
    demuxer: BlockDemuxer,
    decoder: Option<OpusBlockDecoder>,
    sample_rate: u32,
    channels: u16,
}

impl AudioPipeline {
    /// Create a pipeline for the negotiated sample rate and channel count.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            demuxer: BlockDemuxer::new(),
            decoder: None,
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Appends a container chunk and returns the blocks it completed.
    ///
    /// A malformed container is logged; the demuxer resynchronizes and the
    /// blocks recovered around the fault are still returned.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut blocks = Vec::new();
        if let Err(e) = self.demuxer.feed(chunk, &mut blocks) {
            warn!("{}", e);
        }
        blocks
    }

    /// Tells the demuxer that container bytes were lost before the next chunk.
    pub fn resync(&mut self) {
        debug!("Audio input gap, demuxer resynchronizing");
        self.demuxer.resync();
    }

    /// Switches the decode layout. The demuxer keeps its position in the
    /// stream; only the decoder is recreated.
    pub fn set_layout(&mut self, sample_rate: u32, channels: u16) {
        if self.sample_rate == sample_rate && self.channels == channels {
            return;
        }
        debug!(sample_rate, channels, "Audio layout changed, decoder recreated");
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.decoder = None;
    }

    /// Number of blocks the demuxer has produced.
    pub fn blocks(&self) -> u64 {
        self.demuxer.blocks()
    }

    /// Decodes one block to PCM at the configured channel count.
    pub fn decode(&mut self, block: &[u8]) -> AudioResult<Pcm> {
        if self.channels == 0 {
            return Err(AudioError::Unsupported("audio disabled".to_string()));
        }

        let decoder = match self.decoder.take() {
            Some(decoder) => decoder,
            None => OpusBlockDecoder::new(self.sample_rate, self.channels.min(2))?,
        };
        let decoder = self.decoder.insert(decoder);

        let decode_channels = decoder.channels();
        let decoded = decoder.decode(block)?;
        let samples = remix(decoded, decode_channels, self.channels);
        Ok(Pcm {
            samples,
            channels: self.channels,
        })
    }

    /// Packages PCM in a sink's layout, stamped with `timecode`.
    pub fn frame(&self, pcm: &Pcm, format: SampleFormat, timecode: u64) -> AudioResult<AudioFrame> {
        AudioFrame::from_pcm(&pcm.samples, format, self.sample_rate, pcm.channels, timecode)
    }

    /// Drops decoder and demuxer state.
    pub fn reset(&mut self) {
        debug!("Audio pipeline reset");
        self.demuxer.reset();
        self.decoder = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: [u8; 8] = [0xA3, 0x86, 0x81, 0x00, 0x00, 0x80, 0xAA, 0xBB];

    #[test]
    fn test_feed_ignores_garbage_and_recovers() {
        let mut pipeline = AudioPipeline::new(48_000, 2);
        assert!(pipeline.feed(&[0x00, 0x01]).is_empty());

        // The first block after garbage is released once the next one starts.
        assert!(pipeline.feed(&BLOCK).is_empty());
        let payload = Bytes::from_static(&[0xAA, 0xBB]);
        assert_eq!(pipeline.feed(&BLOCK), vec![payload.clone(), payload]);
    }

    #[test]
    fn test_layout_change_keeps_demuxer_position() {
        let mut pipeline = AudioPipeline::new(48_000, 2);
        // Split a block across two chunks with a layout change in between.
        assert!(pipeline.feed(&BLOCK[..3]).is_empty());
        pipeline.set_layout(24_000, 1);
        assert_eq!(pipeline.feed(&BLOCK[3..]), vec![Bytes::from_static(&[0xAA, 0xBB])]);
        assert_eq!((pipeline.sample_rate(), pipeline.channels()), (24_000, 1));
        assert_eq!(pipeline.blocks(), 1);
    }

    #[test]
    fn test_decode_without_audio_is_rejected() {
        let mut pipeline = AudioPipeline::new(48_000, 0);
        assert!(pipeline.decode(&[0xF8]).is_err());
    }

    #[test]
    fn test_frame_layouts() {
        let pipeline = AudioPipeline::new(24_000, 2);
        let pcm = Pcm {
            samples: vec![0; 480 * 2],
            channels: 2,
        };
        assert_eq!(pcm.frames(), 480);

        let planar = pipeline.frame(&pcm, SampleFormat::F32Planar, 1).unwrap();
        assert_eq!((planar.samples, planar.stride), (480, 1920));
        assert_eq!(planar.sample_rate, 24_000);

        let packed = pipeline.frame(&pcm, SampleFormat::S16Interleaved, 1).unwrap();
        assert_eq!((packed.samples, packed.stride), (480, 4));
    }
}
