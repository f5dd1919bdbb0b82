use std::collections::HashMap;
use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::error::{AthenaeumError, Result};
use crate::schema::Volume;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encode an embedding as raw little-endian f32 bytes, base64-encoded.
pub fn encode_embedding(embedding: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode a base64 string produced by [`encode_embedding`].
///
/// Fails with a corrupt-entry error if the base64 is malformed or the
/// decoded byte length is not divisible by 4.
pub fn decode_embedding(encoded: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| AthenaeumError::StacksCorrupt {
            path: "embedding".into(),
            reason: format!("invalid base64: {e}"),
        })?;

    if bytes.len() % 4 != 0 {
        return Err(AthenaeumError::StacksCorrupt {
            path: "embedding".into(),
            reason: format!("byte length {} not divisible by 4", bytes.len()),
        });
    }

    let embedding = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(embedding)
}

/// First two bytes of the gzip magic number, used to detect already
/// compressed text without a side-channel flag.
pub fn is_gzipped(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == GZIP_MAGIC[0] && bytes[1] == GZIP_MAGIC[1]
}

/// Gzip `text` when its UTF-8 byte length exceeds `threshold`.
///
/// Returns the raw UTF-8 bytes unchanged when below the threshold, so
/// callers must check [`is_gzipped`] before decoding.
pub fn maybe_compress_text(text: &str, threshold: usize) -> Result<Vec<u8>> {
    let raw = text.as_bytes();
    if raw.len() <= threshold {
        return Ok(raw.to_vec());
    }

    let mut encoder = GzEncoder::new(raw, Compression::default());
    let mut compressed = Vec::new();
    encoder
        .read_to_end(&mut compressed)
        .map_err(AthenaeumError::StacksIo)?;
    Ok(compressed)
}

/// Inverse of [`maybe_compress_text`]: decompress if gzipped, else assume
/// the bytes are already UTF-8 text.
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    if is_gzipped(bytes) {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(AthenaeumError::StacksIo)?;
        Ok(out)
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|e| AthenaeumError::StacksCorrupt {
            path: "text".into(),
            reason: format!("invalid utf-8: {e}"),
        })
    }
}

fn write_chunk(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn read_chunk(bytes: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    if bytes.len() < *offset + 4 {
        return Err(truncated());
    }
    let len = u32::from_be_bytes(bytes[*offset..*offset + 4].try_into().unwrap()) as usize;
    *offset += 4;
    if bytes.len() < *offset + len {
        return Err(truncated());
    }
    let chunk = bytes[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(chunk)
}

fn truncated() -> AthenaeumError {
    AthenaeumError::StacksCorrupt {
        path: "record".into(),
        reason: "truncated record".into(),
    }
}

/// Per-entry binary record: `text | emb_b64 | meta_json | timestamp (two u32
/// halves, big-endian) | accessCount | lastAccessed`.
pub fn encode_volume(volume: &Volume, gzip_threshold: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    let text_bytes = maybe_compress_text(&volume.text, gzip_threshold)?;
    write_chunk(&mut buf, &text_bytes);

    let emb_b64 = encode_embedding(&volume.embedding);
    write_chunk(&mut buf, emb_b64.as_bytes());

    let meta_json = serde_json::to_vec(&volume.metadata).map_err(|e| AthenaeumError::StacksCorrupt {
        path: "metadata".into(),
        reason: e.to_string(),
    })?;
    write_chunk(&mut buf, &meta_json);

    let ts = volume.timestamp as u64;
    buf.extend_from_slice(&((ts >> 32) as u32).to_be_bytes());
    buf.extend_from_slice(&(ts as u32).to_be_bytes());
    buf.extend_from_slice(&(volume.access_count as u32).to_be_bytes());
    buf.extend_from_slice(&(volume.last_accessed as u64).to_be_bytes());

    Ok(buf)
}

pub fn decode_volume(id: &str, bytes: &[u8]) -> Result<Volume> {
    let mut offset = 0;
    let text_bytes = read_chunk(bytes, &mut offset)?;
    let emb_bytes = read_chunk(bytes, &mut offset)?;
    let meta_bytes = read_chunk(bytes, &mut offset)?;

    if bytes.len() < offset + 20 {
        return Err(truncated());
    }
    let ts_hi = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as u64;
    offset += 4;
    let ts_lo = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as u64;
    offset += 4;
    let access_count = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let last_accessed = u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap());

    let text = decode_text(&text_bytes)?;
    let emb_b64 = String::from_utf8(emb_bytes).map_err(|e| AthenaeumError::StacksCorrupt {
        path: "embedding".into(),
        reason: e.to_string(),
    })?;
    let embedding = decode_embedding(&emb_b64)?;
    let metadata: HashMap<String, String> =
        serde_json::from_slice(&meta_bytes).map_err(|e| AthenaeumError::StacksCorrupt {
            path: "metadata".into(),
            reason: e.to_string(),
        })?;

    Ok(Volume {
        id: id.to_string(),
        text,
        embedding,
        metadata,
        timestamp: (((ts_hi << 32) | ts_lo) as i64),
        access_count: access_count as u64,
        last_accessed: last_accessed as i64,
        topics: Default::default(),
    })
}
