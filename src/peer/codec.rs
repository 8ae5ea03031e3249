//! Text codec for descriptors and candidates.
//!
//! JSON, then zlib, then standard base64: compact enough for a QR code and
//! safe to paste into a text field. Plain JSON is accepted on decode so a
//! payload copied before compression still works.

use crate::error::{CallError, Result};
use crate::peer::types::{ConnectionDescriptor, ConnectivityCandidate};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::error::Category;
use std::io::{Read, Write};

/// Cap on inflated size, against zip bombs
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// A value that can travel through the codec
pub trait Payload: Serialize + DeserializeOwned {
    /// Checks required content that serde alone cannot express.
    fn validate(&self) -> Result<()>;
}

impl Payload for ConnectionDescriptor {
    fn validate(&self) -> Result<()> {
        ConnectionDescriptor::validate(self)
    }
}

impl Payload for ConnectivityCandidate {
    fn validate(&self) -> Result<()> {
        ConnectivityCandidate::validate(self)
    }
}

impl Payload for Vec<ConnectivityCandidate> {
    fn validate(&self) -> Result<()> {
        self.iter().try_for_each(ConnectivityCandidate::validate)
    }
}

pub fn encode<T: Payload>(value: &T) -> Result<String> {
    // 1. JSON -> bytes
    let json = serde_json::to_vec(value).map_err(|e| CallError::Encoding(e.to_string()))?;

    // 2. deflate
    let mut z = ZlibEncoder::new(Vec::new(), Compression::best());
    z.write_all(&json)
        .map_err(|e| CallError::Encoding(e.to_string()))?;
    let compressed = z.finish().map_err(|e| CallError::Encoding(e.to_string()))?;

    // 3. base64
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode<T: Payload>(text: &str) -> Result<T> {
    let json = to_json_bytes(text)?;
    let value: T = serde_json::from_slice(&json).map_err(classify)?;
    value.validate()?;
    Ok(value)
}

/// Accepts either a single candidate object or an array of them.
pub fn decode_candidates(text: &str) -> Result<Vec<ConnectivityCandidate>> {
    let json = to_json_bytes(text)?;
    let value: serde_json::Value = serde_json::from_slice(&json).map_err(classify)?;
    let candidates = match value {
        serde_json::Value::Array(_) => {
            serde_json::from_value::<Vec<ConnectivityCandidate>>(value).map_err(classify)?
        }
        serde_json::Value::Object(_) => {
            vec![serde_json::from_value::<ConnectivityCandidate>(value).map_err(classify)?]
        }
        _ => {
            return Err(CallError::SchemaMismatch(
                "expected a candidate or a list of candidates".into(),
            ))
        }
    };
    candidates.validate()?;
    Ok(candidates)
}

fn to_json_bytes(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CallError::MalformedPayload("empty payload".into()));
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed.as_bytes().to_vec());
    }

    // pasted or scanned text may be wrapped
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();

    // 1. base64 -> bytes
    let compressed = general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CallError::MalformedPayload(format!("not base64: {e}")))?;

    // 2. inflate, bounded
    let mut json = Vec::new();
    ZlibDecoder::new(&compressed[..])
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut json)
        .map_err(|e| CallError::MalformedPayload(format!("decompression failed: {e}")))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(CallError::MalformedPayload("payload too large".into()));
    }
    Ok(json)
}

fn classify(e: serde_json::Error) -> CallError {
    match e.classify() {
        Category::Data => CallError::SchemaMismatch(e.to_string()),
        Category::Syntax | Category::Eof | Category::Io => {
            CallError::MalformedPayload(e.to_string())
        }
    }
}
