// ABOUTME: Audio sample formats and sample specifications for streams

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
/// Default channel count
pub const DEFAULT_NUM_CHANNELS: u8 = 2;

/// Sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8 bit PCM
    U8,
    /// 8 bit a-Law
    Alaw,
    /// 8 bit mu-Law
    Ulaw,
    /// Signed 16 bit PCM, little endian
    S16le,
    /// Signed 16 bit PCM, big endian
    S16be,
    /// 32 bit IEEE float, little endian, range -1.0 to 1.0
    Float32le,
    /// 32 bit IEEE float, big endian, range -1.0 to 1.0
    Float32be,
    /// Signed 32 bit PCM, little endian
    S32le,
    /// Signed 32 bit PCM, big endian
    S32be,
    /// Signed 24 bit PCM packed, little endian
    S24le,
    /// Signed 24 bit PCM packed, big endian
    S24be,
    /// Signed 24 bit PCM in the LSB of 32 bit words, little endian
    S24_32le,
    /// Signed 24 bit PCM in the LSB of 32 bit words, big endian
    S24_32be,
}

impl SampleFormat {
    /// Size of one sample of one channel
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::Alaw | SampleFormat::Ulaw => 1,
            SampleFormat::S16le | SampleFormat::S16be => 2,
            SampleFormat::S24le | SampleFormat::S24be => 3,
            _ => 4,
        }
    }

    /// Parse the server's name for a format
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name {
            "u8" => SampleFormat::U8,
            "aLaw" | "alaw" => SampleFormat::Alaw,
            "uLaw" | "ulaw" => SampleFormat::Ulaw,
            "s16le" => SampleFormat::S16le,
            "s16be" => SampleFormat::S16be,
            "float32le" => SampleFormat::Float32le,
            "float32be" => SampleFormat::Float32be,
            "s32le" => SampleFormat::S32le,
            "s32be" => SampleFormat::S32be,
            "s24le" => SampleFormat::S24le,
            "s24be" => SampleFormat::S24be,
            "s24-32le" => SampleFormat::S24_32le,
            "s24-32be" => SampleFormat::S24_32be,
            _ => return None,
        };
        Some(format)
    }

    /// The server's name for this format
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::Alaw => "aLaw",
            SampleFormat::Ulaw => "uLaw",
            SampleFormat::S16le => "s16le",
            SampleFormat::S16be => "s16be",
            SampleFormat::Float32le => "float32le",
            SampleFormat::Float32be => "float32be",
            SampleFormat::S32le => "s32le",
            SampleFormat::S32be => "s32be",
            SampleFormat::S24le => "s24le",
            SampleFormat::S24be => "s24be",
            SampleFormat::S24_32le => "s24-32le",
            SampleFormat::S24_32be => "s24-32be",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Describes how audio samples are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Sample encoding
    pub format: SampleFormat,
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channels
    pub channels: u8,
}

impl SampleSpec {
    /// Create a spec
    pub fn new(format: SampleFormat, sample_rate: u32, channels: u8) -> Self {
        Self {
            format,
            sample_rate,
            channels,
        }
    }

    /// Bytes in one frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Bytes consumed per second of playback
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.sample_rate as usize
    }

    /// Whether the spec can describe real audio
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16le,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_NUM_CHANNELS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec() {
        let spec = SampleSpec::default();
        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.bytes_per_second(), 176_400);
        assert!(spec.is_valid());
    }

    #[test]
    fn test_format_names() {
        for format in [SampleFormat::S24_32le, SampleFormat::Alaw, SampleFormat::Float32be] {
            assert_eq!(SampleFormat::from_name(format.name()), Some(format));
        }
        assert_eq!(SampleFormat::from_name("s12le"), None);
    }
}
