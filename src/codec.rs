//! Payload encoding for queue items.
//!
//! Items are stored as JSON bytes, optionally gzip-compressed. The format of a
//! stored payload is detected from its first bytes: a gzip stream always starts
//! with the magic `1f 8b`, which can never begin a JSON document. Items written
//! with compression enabled therefore stay readable after the setting changes,
//! and vice versa.
//!
//! Text-only transports (the shared log file, Redis members) carry payloads
//! through [`to_text`] / [`from_text`]: JSON is kept as-is and gzip bytes are
//! base64 encoded behind a `gz:` prefix.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Leading bytes of every gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Prefix marking base64-encoded gzip bytes in a text payload.
const GZIP_TEXT_PREFIX: &str = "gz:";

/// On-storage format of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Plain JSON bytes.
    Json,
    /// Gzip-compressed JSON bytes.
    Gzip,
}

impl PayloadFormat {
    /// Detects the format of stored payload bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            PayloadFormat::Gzip
        } else {
            PayloadFormat::Json
        }
    }
}

/// Serializes a value to JSON, compressing it when `gzip` is set.
pub fn encode<T: Serialize>(value: &T, gzip: bool) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value)?;
    if !gzip {
        return Ok(json);
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decodes payload bytes produced by [`encode`], whatever the gzip setting was.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    match PayloadFormat::detect(bytes) {
        PayloadFormat::Json => Ok(serde_json::from_slice(bytes)?),
        PayloadFormat::Gzip => {
            let mut json = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        }
    }
}

/// Converts payload bytes to a single-line text form.
///
/// Compact JSON never contains a raw newline, so both forms are safe inside
/// newline-terminated records.
pub fn to_text(bytes: &[u8]) -> Result<String, CodecError> {
    match PayloadFormat::detect(bytes) {
        PayloadFormat::Json => String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::NotText),
        PayloadFormat::Gzip => Ok(format!("{}{}", GZIP_TEXT_PREFIX, STANDARD.encode(bytes))),
    }
}

/// Inverse of [`to_text`].
pub fn from_text(text: &str) -> Result<Vec<u8>, CodecError> {
    match text.strip_prefix(GZIP_TEXT_PREFIX) {
        Some(encoded) => Ok(STANDARD.decode(encoded)?),
        None => Ok(text.as_bytes().to_vec()),
    }
}
