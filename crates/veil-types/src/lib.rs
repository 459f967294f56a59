#![forbid(unsafe_code)]
//! Shared newtypes, on-disk constants and byte-level parse helpers.
//!
//! Everything here is format-agnostic plumbing used by the container and
//! FAT32 layers: unit-carrying wrappers to keep sectors, clusters and byte
//! offsets from mixing, plus checked little-/big-endian readers for on-disk
//! structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sector size used throughout the container format.
pub const SECTOR_SIZE: usize = 512;

/// Total size of the on-disk volume header record (salt + encrypted payload).
pub const HEADER_SIZE: usize = 512;

/// Size of the random salt prefixing the header.
pub const SALT_SIZE: usize = 64;

/// Size of the encrypted header payload following the salt.
pub const HEADER_PAYLOAD_SIZE: usize = 448;

/// Size of one header group (primary or backup) reserved at each end of the
/// container. The data area starts after two groups' worth at the front.
pub const HEADER_GROUP_SIZE: u64 = 64 * 1024;

/// Byte offset of the data area in a normal (non-hidden) volume.
pub const DATA_AREA_OFFSET: u64 = 2 * HEADER_GROUP_SIZE;

/// Size of the XTS master key for AES-256 (two 256-bit halves).
pub const MASTER_KEY_SIZE: usize = 64;

/// AES block size; XTS operates on 16-byte blocks.
pub const XTS_BLOCK_SIZE: usize = 16;

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: {field}")]
    ChecksumMismatch { field: &'static str },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Checked byte readers ────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── Byte writers (header / boot-sector builders) ────────────────────────────

#[inline]
pub fn put_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_be_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Decode a space-padded ASCII field (volume labels, fs type strings).
#[must_use]
pub fn trim_space_padded(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_owned()
}

/// Narrow a u64 to usize, naming the field on failure.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
