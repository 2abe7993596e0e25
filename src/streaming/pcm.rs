//! PCM16 codecs for the wire
//!
//! Captured audio leaves as little-endian 16-bit PCM, base64 encoded, tagged
//! `audio/pcm;rate=<hz>`. Incoming agent audio arrives the same way and is
//! decoded back to floats for the output bus.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::transport::MediaChunk;

/// MIME type prefix for raw PCM audio
pub const PCM_MIME: &str = "audio/pcm";

/// Errors decoding an incoming audio chunk
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload is not valid base64
    Base64(String),
    /// PCM16 payload with an odd number of bytes
    OddByteLength(usize),
    /// MIME type is not raw PCM
    UnsupportedEncoding(String),
    /// `rate=` parameter missing a positive integer
    InvalidSampleRate(String),
    /// Chunk carries no samples
    Empty,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Base64(e) => write!(f, "Invalid base64 audio payload: {}", e),
            DecodeError::OddByteLength(len) => {
                write!(f, "PCM16 payload has odd length {} bytes", len)
            }
            DecodeError::UnsupportedEncoding(mime) => {
                write!(f, "Unsupported audio encoding: {}", mime)
            }
            DecodeError::InvalidSampleRate(rate) => write!(f, "Invalid sample rate: {}", rate),
            DecodeError::Empty => write!(f, "Audio chunk is empty"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Sample encoding of an [`AudioChunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Signed 16-bit little-endian, mono
    Pcm16Le,
}

/// Raw fixed-point audio as carried on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub encoding: Encoding,
}

impl AudioChunk {
    /// Decode a media chunk, using `default_rate` when the MIME type has no `rate=`.
    pub fn from_media(media: &MediaChunk, default_rate: u32) -> Result<Self, DecodeError> {
        let (encoding, rate) = parse_mime(&media.mime_type)?;
        let data = decode_base64(&media.data)?;

        Ok(Self {
            data,
            sample_rate: rate.unwrap_or(default_rate),
            encoding,
        })
    }

    /// Encode float samples as a PCM16 chunk.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: pcm16_to_le_bytes(&float_to_pcm16(samples)),
            sample_rate,
            encoding: Encoding::Pcm16Le,
        }
    }

    pub fn sample_count(&self) -> usize {
        match self.encoding {
            Encoding::Pcm16Le => self.data.len() / 2,
        }
    }

    /// Playback length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count() as f64 / self.sample_rate as f64
    }

    pub fn decode_samples(&self) -> Result<Vec<f32>, DecodeError> {
        if self.sample_rate == 0 {
            return Err(DecodeError::InvalidSampleRate("0".to_string()));
        }
        match self.encoding {
            Encoding::Pcm16Le => pcm16_le_to_float(&self.data),
        }
    }

    /// Wrap as an outgoing media chunk.
    pub fn to_media(&self) -> MediaChunk {
        MediaChunk {
            mime_type: pcm_mime(self.sample_rate),
            data: encode_base64(&self.data),
        }
    }
}

/// Convert float samples to PCM16.
///
/// Samples are clamped to [-1, 1]; negatives scale by 32768 and positives by
/// 32767 so both extremes map onto the full i16 range.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian PCM16 to floats (`s / 32768`).
pub fn pcm16_le_to_float(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddByteLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(data)
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// MIME tag for PCM16 at `sample_rate`
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME, sample_rate)
}

/// Parse `audio/pcm[;rate=N]` into an encoding and an optional rate.
pub fn parse_mime(mime: &str) -> Result<(Encoding, Option<u32>), DecodeError> {
    let mut parts = mime.split(';').map(str::trim);
    let base = parts.next().unwrap_or_default();
    if !base.eq_ignore_ascii_case(PCM_MIME) {
        return Err(DecodeError::UnsupportedEncoding(mime.to_string()));
    }

    let mut rate = None;
    for param in parts {
        if let Some(value) = param.strip_prefix("rate=") {
            let parsed = value
                .parse::<u32>()
                .ok()
                .filter(|r| *r > 0)
                .ok_or_else(|| DecodeError::InvalidSampleRate(value.to_string()))?;
            rate = Some(parsed);
        }
    }

    Ok((Encoding::Pcm16Le, rate))
}
