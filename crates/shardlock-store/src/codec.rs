//! Payload encoding between [`SessionItem`](crate::SessionItem) bytes and the
//! stored blob.

use crate::error::{Result, StoreError};

/// Serialization collaborator for session payloads.
pub trait PayloadCodec: Send + Sync {
    /// Encode a payload for storage. `compress` carries the store's
    /// `compress_payload` setting.
    fn encode(&self, payload: &[u8], compress: bool) -> Result<Vec<u8>>;

    /// Decode a stored blob back into the caller's payload.
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>>;
}

const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;

/// Payloads shorter than this are stored raw even when compression is on.
const COMPRESS_MIN_LEN: usize = 64;

/// Default codec: a one-byte format tag followed by the payload, LZ4
/// compressed (size-prepended) when asked to and when that actually shrinks
/// it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedCodec;

fn framed(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(tag);
    out.extend_from_slice(body);
    out
}

impl PayloadCodec for FramedCodec {
    fn encode(&self, payload: &[u8], compress: bool) -> Result<Vec<u8>> {
        if compress && payload.len() >= COMPRESS_MIN_LEN {
            let compressed = lz4_flex::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                return Ok(framed(TAG_LZ4, &compressed));
            }
        }
        Ok(framed(TAG_RAW, payload))
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match stored.split_first() {
            // Records created by an insert with no state carry an empty blob.
            None => Ok(Vec::new()),
            Some((&TAG_RAW, rest)) => Ok(rest.to_vec()),
            Some((&TAG_LZ4, rest)) => lz4_flex::decompress_size_prepended(rest)
                .map_err(|e| StoreError::Codec(format!("LZ4 decompress failed: {e}"))),
            Some((tag, _)) => Err(StoreError::Codec(format!(
                "unknown payload format tag 0x{tag:02x}"
            ))),
        }
    }
}
