//! Common types used across IPC messages.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a capture instance, unique per engine.
pub type InstanceId = String;

/// Highest frame rate an instance may request.
pub const MAX_FRAME_RATE: u32 = 240;

/// Highest channel count an instance may request.
pub const MAX_CHANNELS: u16 = 8;

/// Sample rates the audio decoder can produce.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Configuration of one capture instance.
///
/// Replaced wholesale on reconfiguration, never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Human-readable identity, also used as the network sender name.
    pub title: String,

    /// Content location handed to the rendering host.
    pub source: String,

    /// Output width in pixels.
    pub width: u32,

    /// Output height in pixels.
    pub height: u32,

    /// Target frame rate.
    pub frame_rate: u32,

    /// Audio sample rate in Hz.
    pub sample_rate: u32,

    /// Audio channel count (0 disables audio).
    pub channels: u16,

    /// Whether the instance is also shown on-screen.
    pub display: bool,

    /// Whether preview thumbnails are produced for the operator.
    pub preview: bool,

    /// Whether the network AV sink is enabled.
    pub network: bool,

    /// Whether the subprocess encoder sink is enabled.
    pub subprocess: bool,

    /// Subprocess encoder parameters.
    pub encoder: EncoderConfig,

    /// Whether the capture rate adapts to downstream demand.
    pub adaptive_rate: bool,

    /// Delay applied to video frames before dispatch, in milliseconds.
    pub video_delay_ms: u64,

    /// Delay applied to audio frames before dispatch, in milliseconds.
    pub audio_delay_ms: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            source: String::new(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            sample_rate: 48_000,
            channels: 2,
            display: false,
            preview: false,
            network: false,
            subprocess: false,
            encoder: EncoderConfig::default(),
            adaptive_rate: false,
            video_delay_ms: 0,
            audio_delay_ms: 0,
        }
    }
}

impl InstanceConfig {
    /// Parses a configuration record supplied as JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the record before an instance is started with it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.title.trim().is_empty() {
            return Err(ConfigError::EmptyTitle);
        }
        if self.source.trim().is_empty() {
            return Err(ConfigError::EmptySource);
        }
        if !(self.display || self.consumes_frames()) {
            return Err(ConfigError::NoOutput);
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidGeometry {
                width: self.width,
                height: self.height,
            });
        }
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(ConfigError::InvalidFrameRate(self.frame_rate));
        }
        if self.channels > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannels(self.channels));
        }
        if self.channels > 0 && !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }
        if self.subprocess && !self.encoder.video && !self.encoder.audio {
            return Err(ConfigError::EncoderWithoutMedia);
        }
        Ok(())
    }

    /// Returns true if some path other than the on-screen window consumes frames.
    pub fn consumes_frames(&self) -> bool {
        self.network || self.subprocess || self.preview
    }

    /// Returns true if audio is carried at all.
    pub fn has_audio(&self) -> bool {
        self.channels > 0
    }

    /// Whether the host should mute page audio locally.
    ///
    /// Audio stays audible when the instance is on-screen, or when network
    /// output is enabled but carries no audio.
    pub fn host_audio_muted(&self) -> bool {
        !(self.display || (self.network && self.channels == 0))
    }
}

/// Subprocess encoder parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder binary name or path.
    pub binary: String,

    /// Working directory for the encoder process.
    pub working_dir: Option<PathBuf>,

    /// Output container format.
    pub format: String,

    /// Rate-control mode.
    pub mode: RateControlMode,

    /// Extra arguments appended to the command line (output target included).
    pub args: String,

    /// Whether video is fed to the encoder.
    pub video: bool,

    /// Whether audio is fed to the encoder.
    pub audio: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            working_dir: None,
            format: "matroska".to_string(),
            mode: RateControlMode::default(),
            args: String::new(),
            video: true,
            audio: true,
        }
    }
}

/// Encoder bitrate strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControlMode {
    /// Quality target through a fixed quality factor.
    #[default]
    Vbr,

    /// Computed bitrate with floor and ceiling.
    Abr,

    /// Computed bitrate pinned with a matching buffer.
    Cbr,
}

impl RateControlMode {
    /// Returns the configuration string for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vbr => "vbr",
            Self::Abr => "abr",
            Self::Cbr => "cbr",
        }
    }
}

impl fmt::Display for RateControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateControlMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vbr" => Ok(Self::Vbr),
            "abr" => Ok(Self::Abr),
            "cbr" => Ok(Self::Cbr),
            other => Err(ConfigError::UnknownRateControl(other.to_string())),
        }
    }
}

/// Downstream presence state of the network sink.
///
/// Ordered by priority: `Program > Preview > Connected > Unconnected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tally {
    /// Nobody is receiving the stream.
    #[default]
    Unconnected,

    /// At least one receiver is connected.
    Connected,

    /// A receiver shows the stream on preview.
    Preview,

    /// A receiver shows the stream on program.
    Program,
}

impl Tally {
    /// Derives the tally from the transport's connection count and flags.
    pub fn from_flags(connections: u32, program: bool, preview: bool) -> Self {
        if program {
            Self::Program
        } else if preview {
            Self::Preview
        } else if connections > 0 {
            Self::Connected
        } else {
            Self::Unconnected
        }
    }

    /// Returns the display name for this tally.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connected => "connected",
            Self::Preview => "preview",
            Self::Program => "program",
        }
    }
}

/// Media type of a statistics or rate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
}

/// Configuration validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("title must not be empty")]
    EmptyTitle,

    #[error("source must not be empty")]
    EmptySource,

    #[error("no display, preview, network or subprocess output enabled")]
    NoOutput,

    #[error("invalid geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("frame rate {0} outside 1..=240")]
    InvalidFrameRate(u32),

    #[error("unsupported sample rate {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("channel count {0} exceeds 8")]
    InvalidChannels(u16),

    #[error("subprocess output enabled without video or audio")]
    EncoderWithoutMedia,

    #[error("unknown rate-control mode: {0}")]
    UnknownRateControl(String),

    #[error("malformed configuration: {0}")]
    Parse(String),
}
