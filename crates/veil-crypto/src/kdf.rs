//! Header-key derivation: PBKDF2-HMAC-SHA512 with the PIM schedule.

use hmac::Hmac;
use sha2::Sha512;
use std::fmt;
use veil_error::{Result, VeilError};
use veil_types::MASTER_KEY_SIZE;
use zeroize::Zeroize;

/// Size of the derived header key: two 256-bit halves for AES-256 XTS.
pub const HEADER_KEY_SIZE: usize = 64;

/// Which kind of volume the iteration schedule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// A regular file/partition container.
    NonSystem,
    /// Whole-system encryption (schedule supported for header compatibility
    /// only; mounting system volumes is out of scope).
    System,
}

/// PBKDF2 iteration count for SHA-512 as a function of volume kind and PIM.
///
/// A PIM of zero or less selects the defaults.
#[must_use]
pub fn iterations(kind: VolumeKind, pim: i32) -> u32 {
    if pim <= 0 {
        return match kind {
            VolumeKind::NonSystem => 500_000,
            VolumeKind::System => 200_000,
        };
    }
    let pim = pim as u32;
    match kind {
        VolumeKind::NonSystem => 15_000_u32.saturating_add(pim.saturating_mul(1_000)),
        VolumeKind::System => pim.saturating_mul(2_048),
    }
}

/// A 512-bit key derived from the password; decrypts the volume header.
///
/// Zeroized on drop to keep secrets from lingering in memory.
#[derive(Clone)]
pub struct HeaderKey {
    bytes: [u8; HEADER_KEY_SIZE],
}

impl HeaderKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; HEADER_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HEADER_KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for HeaderKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The 512-bit XTS master key recovered from a decrypted header.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_SIZE],
}

impl MasterKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; MASTER_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the header key from a (possibly keyfile-mixed) password and the
/// 64-byte salt read from the head of the container.
pub fn derive_header_key(password: &[u8], salt: &[u8], iterations: u32) -> Result<HeaderKey> {
    if iterations == 0 {
        return Err(VeilError::InvalidArgument(
            "PBKDF2 iteration count must be nonzero".to_owned(),
        ));
    }
    let mut okm = [0_u8; HEADER_KEY_SIZE];
    pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt, iterations, &mut okm)
        .map_err(|e| VeilError::InvalidArgument(format!("PBKDF2 failed: {e}")))?;
    let key = HeaderKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}
