//! Minimal binary codec helpers shared by the set encodings.
//!
//! All multi-byte integers are big-endian. Variable-length payloads are
//! length-prefixed by the caller; these helpers only bounds-check reads.

use crate::Hash;
use bytes::{Buf, Bytes};

/// Errors raised while decoding a binary payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The payload ended before the expected field.
    #[error("unexpected end of payload")]
    UnexpectedEnd,

    /// A version byte did not match any supported layout.
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    /// Trailing garbage after a complete payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Read one byte.
pub fn get_u8(buf: &mut impl Buf) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

/// Read a big-endian u16.
pub fn get_u16(buf: &mut impl Buf) -> Result<u16, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u16())
}

/// Read a big-endian u32.
pub fn get_u32(buf: &mut impl Buf) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u32())
}

/// Read a big-endian u64.
pub fn get_u64(buf: &mut impl Buf) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u64())
}

/// Read a 32-byte hash.
pub fn get_hash(buf: &mut impl Buf) -> Result<Hash, DecodeError> {
    if buf.remaining() < Hash::BYTES {
        return Err(DecodeError::UnexpectedEnd);
    }
    let mut raw = [0u8; Hash::BYTES];
    buf.copy_to_slice(&mut raw);
    Ok(Hash::from(raw))
}

/// Read `len` raw bytes.
pub fn get_blob(buf: &mut impl Buf, len: usize) -> Result<Bytes, DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.copy_to_bytes(len))
}
