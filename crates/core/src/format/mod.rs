//! Input normalisation and container sniffing.
//!
//! Speech arrives in whatever shape the producer handed back: base64 text
//! (optionally wrapped in a `data:` URL), raw bytes, or a blob carrying a
//! declared content type that is frequently wrong. Everything funnels into a
//! [`NormalizedAudio`] before it reaches the decoder.

use base64::{
    alphabet,
    engine::{
        general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD},
        Engine as _,
    },
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AudioError, Result};

/// Number of text characters decoded per step. Multiple of the base64 block.
const TEXT_CHUNK_CHARS: usize = 32 * 1024;
/// Number of bytes encoded per step. Multiple of the 3-byte base64 group.
const BINARY_CHUNK_BYTES: usize = 24 * 1024;
/// Accepts non-zero trailing bits the way browser `atob` does, so truncated
/// payloads decode instead of failing.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);
/// Bytes inspected by [`detect_format`].
pub const SIGNATURE_LEN: usize = 12;
/// Bytes included in diagnostics when a payload fails to decode.
const DIAGNOSTIC_PREFIX_LEN: usize = 8;

/// Audio handed to the engine by a speech producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioInput {
    /// Base64 text, optionally prefixed with `data:<type>;base64,`.
    Text(String),
    /// Encoded container bytes.
    Binary(Vec<u8>),
    /// Binary object with a caller-declared content type.
    Blob { bytes: Vec<u8>, content_type: String },
}

impl AudioInput {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    pub fn blob(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self::Blob {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    /// Wraps a `data:` URL. Equivalent to [`AudioInput::Text`]; the prefix is
    /// stripped during normalisation.
    pub fn from_data_url(url: impl Into<String>) -> Self {
        Self::Text(url.into())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

/// Container type inferred from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedFormat {
    /// MPEG layered audio, with or without an ID3 tag.
    Mpeg,
    Wav,
    Mp4,
    Ogg,
    /// Matroska / WebM audio.
    Matroska,
    Flac,
    /// Raw ADTS-framed AAC.
    Aac,
    Unknown,
}

impl DetectedFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mpeg => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Mp4 => "audio/mp4",
            Self::Ogg => "audio/ogg",
            Self::Matroska => "audio/webm",
            Self::Flac => "audio/flac",
            Self::Aac => "audio/aac",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// File extension handed to the decoder as a probe hint.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::Mpeg => Some("mp3"),
            Self::Wav => Some("wav"),
            Self::Mp4 => Some("m4a"),
            Self::Ogg => Some("ogg"),
            Self::Matroska => Some("webm"),
            Self::Flac => Some("flac"),
            Self::Aac => Some("aac"),
            Self::Unknown => None,
        }
    }

    /// Maps a declared MIME type onto a container, ignoring parameters.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let format = match essence.as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" => Self::Mpeg,
            "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => Self::Wav,
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "video/mp4" => Self::Mp4,
            "audio/ogg" | "audio/opus" | "application/ogg" => Self::Ogg,
            "audio/webm" | "video/webm" | "audio/x-matroska" => Self::Matroska,
            "audio/flac" | "audio/x-flac" => Self::Flac,
            "audio/aac" | "audio/aacp" => Self::Aac,
            _ => return None,
        };
        Some(format)
    }
}

impl Default for DetectedFormat {
    fn default() -> Self {
        Self::Mpeg
    }
}

/// Canonical byte buffer plus the labels gathered while producing it.
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub bytes: Vec<u8>,
    pub declared_type: Option<String>,
    pub detected: DetectedFormat,
}

impl NormalizedAudio {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Converts any [`AudioInput`] into a canonical byte buffer.
pub fn normalize(input: &AudioInput) -> Result<NormalizedAudio> {
    let (bytes, declared_type) = match input {
        AudioInput::Text(text) => {
            let (declared, payload) = split_data_url(text);
            (decode_text(payload)?, declared.map(str::to_string))
        }
        AudioInput::Binary(bytes) => (bytes.clone(), None),
        AudioInput::Blob {
            bytes,
            content_type,
        } => (bytes.clone(), Some(content_type.clone())),
    };

    let detected = detect_format(&bytes);
    if let Some(declared) = declared_type
        .as_deref()
        .and_then(DetectedFormat::from_content_type)
    {
        if declared != detected && bytes.len() >= SIGNATURE_LEN {
            debug!(?declared, ?detected, "declared content type disagrees with signature");
        }
    }

    Ok(NormalizedAudio {
        bytes,
        declared_type,
        detected,
    })
}

/// Inspects the first [`SIGNATURE_LEN`] bytes against known container
/// signatures. This is a tagging aid; the decoder has the final say.
pub fn detect_format(bytes: &[u8]) -> DetectedFormat {
    if bytes.len() < SIGNATURE_LEN {
        return DetectedFormat::default();
    }

    match bytes {
        [b'I', b'D', b'3', ..] => DetectedFormat::Mpeg,
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => DetectedFormat::Wav,
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => DetectedFormat::Mp4,
        [b'O', b'g', b'g', b'S', ..] => DetectedFormat::Ogg,
        [0x1A, 0x45, 0xDF, 0xA3, ..] => DetectedFormat::Matroska,
        [b'f', b'L', b'a', b'C', ..] => DetectedFormat::Flac,
        // ADTS: 12-bit sync with the layer bits cleared.
        [0xFF, second, ..] if second & 0xF6 == 0xF0 => DetectedFormat::Aac,
        // MPEG frame sync: 11 set bits.
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => DetectedFormat::Mpeg,
        _ => DetectedFormat::Unknown,
    }
}

/// Structural check of base64 text: alphabet and padding only.
pub fn is_valid_encoded_text(text: &str) -> bool {
    let (_, payload) = split_data_url(text);
    let compact: Vec<u8> = payload
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();

    if compact.is_empty() || compact.len() % 4 != 0 {
        return false;
    }

    let padding = compact.iter().rev().take_while(|byte| **byte == b'=').count();
    if padding > 2 {
        return false;
    }

    compact[..compact.len() - padding]
        .iter()
        .all(|byte| is_alphabet(*byte))
}

/// Encodes bytes as standard padded base64, a chunk at a time.
pub fn encode_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(BINARY_CHUNK_BYTES) {
        STANDARD.encode_string(chunk, &mut out);
    }
    out
}

/// Hex rendering of the first few bytes, for error messages.
pub fn diagnostic_prefix(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(DIAGNOSTIC_PREFIX_LEN)])
}

fn split_data_url(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start();
    if !trimmed.starts_with("data:") {
        return (None, text);
    }

    match trimmed.split_once(',') {
        Some((header, payload)) => {
            let media = header["data:".len()..]
                .split(';')
                .next()
                .filter(|media| !media.is_empty());
            (media, payload)
        }
        None => (None, text),
    }
}

fn decode_text(payload: &str) -> Result<Vec<u8>> {
    let mut cleaned: Vec<u8> = payload
        .bytes()
        .filter_map(|byte| match byte {
            b'-' => Some(b'+'),
            b'_' => Some(b'/'),
            byte if is_alphabet(byte) => Some(byte),
            _ => None,
        })
        .collect();

    if cleaned.is_empty() {
        return Err(AudioError::invalid_data("encoded audio text is empty"));
    }

    match cleaned.len() % 4 {
        0 => {}
        2 => cleaned.extend_from_slice(b"=="),
        3 => cleaned.push(b'='),
        _ => {
            return Err(AudioError::invalid_data(format!(
                "encoded audio text has an impossible length of {} symbols",
                cleaned.len()
            )))
        }
    }

    let mut out = Vec::with_capacity(cleaned.len() / 4 * 3);
    for chunk in cleaned.chunks(TEXT_CHUNK_CHARS) {
        LENIENT.decode_vec(chunk, &mut out).map_err(|err| {
            AudioError::invalid_data("encoded audio text is malformed").with_cause(err)
        })?;
    }

    Ok(out)
}

fn is_alphabet(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/'
}
