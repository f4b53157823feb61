//! Encoder command-line construction.

use crate::error::EncoderError;
use crate::policy::EncoderParams;
use crate::EncoderResult;

/// Builds the ffmpeg argument list for one instance.
///
/// Video arrives as raw RGBA on standard input, audio as raw signed 16-bit
/// PCM over a loopback TCP connection. A disabled media type drops its input
/// and its mapping entirely.
#[derive(Debug, Clone)]
pub struct FfmpegArgsBuilder {
    width: u32,
    height: u32,
    frame_rate: u32,
    video: bool,
    audio: Option<AudioInput>,
    format: String,
    params: Option<EncoderParams>,
    extra: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct AudioInput {
    sample_rate: u32,
    channels: u16,
    port: u16,
}

impl FfmpegArgsBuilder {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
            video: true,
            audio: None,
            format: "matroska".to_string(),
            params: None,
            extra: Vec::new(),
        }
    }

    pub fn with_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Adds the audio input the encoder reads from `127.0.0.1:port`.
    pub fn with_audio(mut self, sample_rate: u32, channels: u16, port: u16) -> Self {
        self.audio = Some(AudioInput {
            sample_rate,
            channels,
            port,
        });
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_params(mut self, params: EncoderParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Appends user-supplied arguments, split like a shell would.
    pub fn with_extra_args(mut self, extra: &str) -> EncoderResult<Self> {
        self.extra = split_args(extra)?;
        Ok(self)
    }

    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-use_wallclock_as_timestamps",
            "1",
            "-fflags",
            "+genpts",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.video {
            args.extend([
                "-f".to_string(),
                "rawvideo".to_string(),
                "-pix_fmt".to_string(),
                "rgba".to_string(),
                "-s".to_string(),
                format!("{}x{}", self.width, self.height),
                "-framerate".to_string(),
                self.frame_rate.to_string(),
                "-i".to_string(),
                "pipe:0".to_string(),
            ]);
        }

        if let Some(audio) = self.audio {
            args.extend([
                "-f".to_string(),
                "s16le".to_string(),
                "-ar".to_string(),
                audio.sample_rate.to_string(),
                "-ac".to_string(),
                audio.channels.to_string(),
                "-i".to_string(),
                format!("tcp://127.0.0.1:{}", audio.port),
            ]);
        }

        let mut input = 0;
        if self.video {
            args.extend(["-map".to_string(), format!("{input}:v:0")]);
            input += 1;
        }
        if self.audio.is_some() {
            args.extend(["-map".to_string(), format!("{input}:a:0")]);
        }

        args.extend(["-threads".to_string(), "4".to_string()]);
        if self.video && self.audio.is_some() {
            args.push("-shortest".to_string());
        }

        if self.video {
            args.extend(
                [
                    "-c:v",
                    "libx264",
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "zerolatency",
                    "-pix_fmt",
                    "yuv420p",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
            if let Some(params) = &self.params {
                args.extend(params.args.iter().cloned());
            }
        }
        if self.audio.is_some() {
            args.extend(["-c:a".to_string(), "aac".to_string()]);
        }

        args.extend(
            [
                "-movflags",
                "frag_keyframe+omit_tfhd_offset+empty_moov+default_base_moof+faststart",
                "-flush_packets",
                "1",
                "-y",
                "-f",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(self.format.clone());
        args.extend(self.extra.iter().cloned());

        args
    }
}

/// Splits an argument string on whitespace, honoring single quotes, double
/// quotes and backslash escapes.
pub fn split_args(input: &str) -> EncoderResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                Some(escaped) => {
                    current.push(escaped);
                    in_word = true;
                }
                None => {
                    return Err(EncoderError::InvalidArgs(
                        "trailing backslash".to_string(),
                    ))
                }
            },
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(EncoderError::InvalidArgs(format!("unterminated {q} quote")));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}
