#![forbid(unsafe_code)]
//! Cryptographic primitives for the container format.
//!
//! Four concerns live here: the raw rolling CRC32 register used by keyfile
//! mixing, PBKDF2-HMAC-SHA512 header-key derivation with the PIM iteration
//! schedule, the keyfile pool mixer, and the AES-XTS sector codec with its
//! batched tweak-schedule pipeline.

pub mod crc32;
pub mod kdf;
pub mod keyfile;
pub mod xts;

pub use kdf::{derive_header_key, iterations, HeaderKey, MasterKey, VolumeKind};
pub use keyfile::{mix_password, Keyfile};
pub use xts::XtsCodec;
