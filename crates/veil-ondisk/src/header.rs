//! Volume header payload codec.
//!
//! The decrypted header payload is 448 bytes (a 512-byte record minus the
//! 64-byte salt). Every multi-byte field is big-endian. Two CRC32 checksums
//! guard it: one over the 256-byte master keydata region, one over the
//! 188-byte field prefix. A parse failure after trial decryption means the
//! password was wrong or the header is damaged; callers must not
//! distinguish the two.

use serde::Serialize;
use veil_types::{
    put_be_u16, put_be_u32, put_be_u64, read_be_u16, read_be_u32, read_be_u64, read_fixed,
    ParseError, HEADER_PAYLOAD_SIZE, MASTER_KEY_SIZE,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Header magic for volumes in this format.
pub const HEADER_MAGIC: [u8; 4] = *b"VERA";

/// Header format version written on create.
pub const HEADER_VERSION: u16 = 5;

/// Minimum program version required to mount volumes we create.
pub const MIN_PROGRAM_VERSION: u16 = 0x010B;

/// Size of the master keydata region at the tail of the payload.
pub const KEYDATA_SIZE: usize = 256;

const KEYDATA_OFFSET: usize = 192;
const HEADER_CRC_OFFSET: usize = 188;
const HEADER_CRC_SPAN: usize = 188;

/// Volume flag: system-encrypted.
pub const FLAG_SYSTEM_ENCRYPTION: u32 = 1 << 0;
/// Volume flag: non-system in-place encryption.
pub const FLAG_NONSYS_INPLACE: u32 = 1 << 1;

/// Decrypted volume header. Holds the master keydata, so the whole struct
/// is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    pub version: u16,
    pub min_program_version: u16,
    pub key_area_crc32: u32,
    pub volume_creation_time: u64,
    pub header_modification_time: u64,
    pub hidden_volume_size: u64,
    pub data_area_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
    pub header_crc32: u32,
    pub master_keydata: [u8; KEYDATA_SIZE],
}

impl std::fmt::Debug for VolumeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHeader")
            .field("version", &self.version)
            .field("data_area_size", &self.data_area_size)
            .field("encrypted_area_start", &self.encrypted_area_start)
            .field("sector_size", &self.sector_size)
            .field("master_keydata", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Key-material-free view of a header for inspection output.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderSummary {
    pub version: u16,
    pub min_program_version: u16,
    pub volume_creation_time: u64,
    pub header_modification_time: u64,
    pub data_area_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
}

/// Inputs for building a fresh header payload.
#[derive(Debug, Clone)]
pub struct HeaderParams {
    pub volume_creation_time: u64,
    pub header_modification_time: u64,
    pub data_area_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
}

impl VolumeHeader {
    /// Parse and validate a decrypted 448-byte payload.
    ///
    /// Validation order: magic, key-area CRC, header CRC. Any failure here
    /// after a trial decryption is an authentication failure upstream.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < HEADER_PAYLOAD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_PAYLOAD_SIZE,
                offset: 0,
                actual: payload.len(),
            });
        }

        let magic = read_fixed::<4>(payload, 0)?;
        if magic != HEADER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_be_bytes(HEADER_MAGIC)),
                actual: u64::from(u32::from_be_bytes(magic)),
            });
        }

        let key_area_crc32 = read_be_u32(payload, 8)?;
        let computed_key_crc =
            crc32fast::hash(&payload[KEYDATA_OFFSET..KEYDATA_OFFSET + KEYDATA_SIZE]);
        if key_area_crc32 != computed_key_crc {
            return Err(ParseError::ChecksumMismatch {
                field: "key_area_crc32",
            });
        }

        let header_crc32 = read_be_u32(payload, HEADER_CRC_OFFSET)?;
        let computed_header_crc = crc32fast::hash(&payload[..HEADER_CRC_SPAN]);
        if header_crc32 != computed_header_crc {
            return Err(ParseError::ChecksumMismatch {
                field: "header_crc32",
            });
        }

        let sector_size = read_be_u32(payload, 64)?;
        if sector_size == 0 || sector_size % 512 != 0 || sector_size > 4096 {
            return Err(ParseError::InvalidField {
                field: "sector_size",
                reason: "must be a multiple of 512 up to 4096",
            });
        }

        Ok(Self {
            version: read_be_u16(payload, 4)?,
            min_program_version: read_be_u16(payload, 6)?,
            key_area_crc32,
            volume_creation_time: read_be_u64(payload, 12)?,
            header_modification_time: read_be_u64(payload, 20)?,
            hidden_volume_size: read_be_u64(payload, 28)?,
            data_area_size: read_be_u64(payload, 36)?,
            encrypted_area_start: read_be_u64(payload, 44)?,
            encrypted_area_length: read_be_u64(payload, 52)?,
            flags: read_be_u32(payload, 60)?,
            sector_size,
            header_crc32,
            master_keydata: read_fixed::<KEYDATA_SIZE>(payload, KEYDATA_OFFSET)?,
        })
    }

    /// Serialize a fresh payload with both CRC slots filled in.
    #[must_use]
    pub fn build(params: &HeaderParams, master_keydata: &[u8; KEYDATA_SIZE]) -> Vec<u8> {
        let mut payload = vec![0_u8; HEADER_PAYLOAD_SIZE];
        payload[..4].copy_from_slice(&HEADER_MAGIC);
        put_be_u16(&mut payload, 4, HEADER_VERSION);
        put_be_u16(&mut payload, 6, MIN_PROGRAM_VERSION);
        put_be_u64(&mut payload, 12, params.volume_creation_time);
        put_be_u64(&mut payload, 20, params.header_modification_time);
        put_be_u64(&mut payload, 28, 0); // no hidden volume
        put_be_u64(&mut payload, 36, params.data_area_size);
        put_be_u64(&mut payload, 44, params.encrypted_area_start);
        put_be_u64(&mut payload, 52, params.encrypted_area_length);
        put_be_u32(&mut payload, 60, params.flags);
        put_be_u32(&mut payload, 64, params.sector_size);
        payload[KEYDATA_OFFSET..].copy_from_slice(master_keydata);

        let key_crc = crc32fast::hash(&payload[KEYDATA_OFFSET..]);
        put_be_u32(&mut payload, 8, key_crc);
        let header_crc = crc32fast::hash(&payload[..HEADER_CRC_SPAN]);
        put_be_u32(&mut payload, HEADER_CRC_OFFSET, header_crc);

        payload
    }

    /// The XTS master key: the first 64 bytes of the keydata region.
    #[must_use]
    pub fn master_key_bytes(&self) -> [u8; MASTER_KEY_SIZE] {
        let mut key = [0_u8; MASTER_KEY_SIZE];
        key.copy_from_slice(&self.master_keydata[..MASTER_KEY_SIZE]);
        key
    }

    #[must_use]
    pub fn summary(&self) -> HeaderSummary {
        HeaderSummary {
            version: self.version,
            min_program_version: self.min_program_version,
            volume_creation_time: self.volume_creation_time,
            header_modification_time: self.header_modification_time,
            data_area_size: self.data_area_size,
            encrypted_area_start: self.encrypted_area_start,
            encrypted_area_length: self.encrypted_area_length,
            flags: self.flags,
            sector_size: self.sector_size,
        }
    }
}
