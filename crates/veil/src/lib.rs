#![forbid(unsafe_code)]
//! VeilFS public API facade.
//!
//! Re-exports the container lifecycle and filesystem surface through one
//! crate. This is what downstream consumers (CLI, harness) depend on.

pub use veil_block::{ByteDevice, FileByteDevice, MemByteDevice, SectorDevice};
pub use veil_crypto::{mix_password, Keyfile, XtsCodec};
pub use veil_error::{Result, VeilError};
pub use veil_fat::{normalize_path, FatFs, FileEntry};
pub use veil_ondisk::{BootSector, HeaderSummary};
pub use veil_types::{DATA_AREA_OFFSET, SECTOR_SIZE};
pub use veil_volume::{create_container, open_container, MountedVolume, MIN_CONTAINER_SIZE};
