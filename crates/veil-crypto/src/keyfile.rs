//! Keyfile pool mixing.
//!
//! Keyfiles modify the password before key derivation: each keyfile byte
//! advances a rolling CRC32 register, and the four bytes of the register
//! (MSB first) are added mod 256 into a 64- or 128-byte pool at a wrapping
//! write cursor. The mixed password is `password[i] + pool[i] mod 256` over
//! `max(|password|, poolSize)` positions. The layout is wire-compatible
//! with existing volumes, so none of the constants here are tunable.

use crate::crc32::Crc32;
use std::fs;
use std::path::Path;
use veil_error::Result;
use zeroize::Zeroize;

/// At most this many bytes of each keyfile participate in mixing.
pub const KEYFILE_MAX_READ: usize = 1024 * 1024;

/// Pool size for passwords of at most 64 bytes.
const POOL_SMALL: usize = 64;
/// Pool size for longer passwords.
const POOL_LARGE: usize = 128;

/// An in-memory keyfile, already truncated to [`KEYFILE_MAX_READ`].
#[derive(Clone)]
pub struct Keyfile {
    bytes: Vec<u8>,
}

impl Keyfile {
    /// Wrap raw keyfile content. Only the first 1 MiB participates.
    #[must_use]
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(KEYFILE_MAX_READ);
        Self { bytes }
    }

    /// Load a keyfile from disk, reading at most 1 MiB.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Ok(Self::from_bytes(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for Keyfile {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Fold `keyfiles` into `password`, producing the derived password buffer
/// fed to PBKDF2. With no keyfiles the password is returned unchanged.
#[must_use]
pub fn mix_password(password: &[u8], keyfiles: &[Keyfile]) -> Vec<u8> {
    if keyfiles.is_empty() {
        return password.to_vec();
    }

    let pool_size = if password.len() <= POOL_SMALL {
        POOL_SMALL
    } else {
        POOL_LARGE
    };
    let mut pool = vec![0_u8; pool_size];

    for keyfile in keyfiles {
        let mut crc = Crc32::new();
        let mut cursor = 0_usize;
        for &byte in keyfile.as_bytes() {
            crc.update_byte(byte);
            for crc_byte in crc.state().to_be_bytes() {
                pool[cursor] = pool[cursor].wrapping_add(crc_byte);
                cursor = (cursor + 1) % pool_size;
            }
        }
    }

    let out_len = password.len().max(pool_size);
    let mut mixed = vec![0_u8; out_len];
    for (i, slot) in mixed.iter_mut().enumerate() {
        let p = password.get(i).copied().unwrap_or(0);
        let k = pool.get(i).copied().unwrap_or(0);
        *slot = p.wrapping_add(k);
    }

    pool.zeroize();
    mixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_keyfiles_returns_password_verbatim() {
        assert_eq!(mix_password(b"secret", &[]), b"secret");
    }

    #[test]
    fn mixing_is_deterministic() {
        let kf = Keyfile::from_bytes(b"keyfile_content_123".to_vec());
        let a = mix_password(b"", &[kf.clone()]);
        let b = mix_password(b"", &[kf]);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_password_mixes_to_small_pool_size() {
        let kf = Keyfile::from_bytes(b"keyfile_content_123".to_vec());
        let mixed = mix_password(b"", &[kf]);
        assert_eq!(mixed.len(), 64);
        assert!(mixed.iter().any(|&b| b != 0), "pool must absorb the keyfile");
    }

    #[test]
    fn long_password_selects_large_pool() {
        let password = vec![b'x'; 65];
        let kf = Keyfile::from_bytes(b"data".to_vec());
        let mixed = mix_password(&password, &[kf]);
        assert_eq!(mixed.len(), 128);
    }

    #[test]
    fn keyfile_order_matters() {
        let a = Keyfile::from_bytes(b"first".to_vec());
        let b = Keyfile::from_bytes(b"second".to_vec());
        let ab = mix_password(b"pw", &[a.clone(), b.clone()]);
        let ba = mix_password(b"pw", &[b, a]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn mixed_password_adds_pool_to_password_bytes() {
        // With a single zero-filled keyfile byte the pool contents are the
        // CRC register bytes of 0x00; the password bytes must shift by the
        // same pool values at matching positions.
        let kf = Keyfile::from_bytes(vec![0_u8]);
        let base = mix_password(b"", &[kf.clone()]);
        let shifted = mix_password(b"\x01", &[kf]);
        assert_eq!(shifted[0], base[0].wrapping_add(1));
        assert_eq!(&shifted[1..], &base[1..]);
    }

    #[test]
    fn oversized_keyfile_is_truncated() {
        let big = Keyfile::from_bytes(vec![0xAB; KEYFILE_MAX_READ + 4096]);
        assert_eq!(big.as_bytes().len(), KEYFILE_MAX_READ);
    }
}
