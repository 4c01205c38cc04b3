//! DEFLATE helpers for frame bodies and file transfer stream chunks.
//!
//! Stream chunks are self-describing so the receiver can tell a compressed
//! chunk from a stored one:
//!
//! ```text
//! [method u8][reserved u8][uncompressed length u32 BE][data]
//! ```

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::decompress_to_vec_zlib_with_limit;

/// Chunk stored as-is.
pub const METHOD_NONE: u8 = 0;
/// Chunk compressed with zlib-wrapped DEFLATE.
pub const METHOD_DEFLATE: u8 = 1;

/// Size of the stream chunk header.
pub const CHUNK_HEADER_SIZE: usize = 6;

const COMPRESSION_LEVEL: u8 = 6;

/// Compresses `input` into a zlib stream.
pub fn deflate(input: &[u8]) -> Vec<u8> {
    compress_to_vec_zlib(input, COMPRESSION_LEVEL)
}

/// Inflates a zlib stream that is expected to expand to exactly
/// `expected_len` bytes.
pub fn inflate(input: &[u8], expected_len: usize) -> Result<Vec<u8>, ProtocolError> {
    let out = decompress_to_vec_zlib_with_limit(input, expected_len)
        .map_err(|e| ProtocolError::Decompress(format!("{:?}", e.status)))?;
    if out.len() != expected_len {
        return Err(ProtocolError::Decompress(format!(
            "expected {} bytes, got {}",
            expected_len,
            out.len()
        )));
    }
    Ok(out)
}

/// Wraps one file chunk for a stream transfer. Falls back to a stored chunk
/// when DEFLATE does not make it smaller.
pub fn compress_chunk(input: &[u8]) -> Bytes {
    let packed = deflate(input);
    let (method, data): (u8, &[u8]) = if packed.len() < input.len() {
        (METHOD_DEFLATE, &packed)
    } else {
        (METHOD_NONE, input)
    };
    let mut out = BytesMut::with_capacity(CHUNK_HEADER_SIZE + data.len());
    out.put_u8(method);
    out.put_u8(0);
    out.put_u32(input.len() as u32);
    out.put_slice(data);
    out.freeze()
}

/// Reverses [`compress_chunk`].
pub fn decompress_chunk(chunk: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if chunk.len() < CHUNK_HEADER_SIZE {
        return Err(ProtocolError::Truncated);
    }
    let mut header = &chunk[..CHUNK_HEADER_SIZE];
    let method = header.get_u8();
    let _reserved = header.get_u8();
    let original_len = header.get_u32() as usize;
    let data = &chunk[CHUNK_HEADER_SIZE..];

    match method {
        METHOD_NONE => {
            if data.len() != original_len {
                return Err(ProtocolError::Truncated);
            }
            Ok(data.to_vec())
        }
        METHOD_DEFLATE => inflate(data, original_len),
        other => Err(ProtocolError::UnsupportedCompression(other)),
    }
}
