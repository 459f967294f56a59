#![forbid(unsafe_code)]
//! FAT32 engine over the encrypted sector device.
//!
//! The reader side resolves paths by walking directory clusters with
//! long-filename reconstruction and serves file content through coalesced
//! multi-sector reads. The writer side allocates cluster chains with a
//! rolling hint cursor, mirrors every FAT mutation to both FAT copies and
//! keeps long-filename invariants intact on entry creation and deletion.
//!
//! Concurrency: read operations share the volume lock, mutations take it
//! exclusively. The FAT-sector, cluster-chain and directory-listing caches
//! have their own short critical sections and are invalidated on every
//! mutation that touches them.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use veil_block::SectorDevice;
use veil_error::{Result, VeilError};
use veil_ondisk::BootSector;

mod cache;
mod reader;
#[cfg(test)]
mod tests_engine;
mod writer;

pub(crate) use cache::Caches;

/// A resolved directory entry as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Display name; the long name when one is stored, else the 8.3 name.
    pub name: String,
    /// Full path of the entry within the volume.
    pub path: String,
    pub is_directory: bool,
    /// File size in bytes; zero for directories.
    pub size: u64,
    /// Modification time as unix seconds.
    pub last_modified: i64,
    /// First cluster of the entry's chain; zero for an empty file.
    pub first_cluster: u32,
}

/// Mounted FAT32 filesystem over a [`SectorDevice`].
pub struct FatFs {
    pub(crate) dev: Arc<SectorDevice>,
    pub(crate) boot: BootSector,
    pub(crate) caches: Caches,
    pub(crate) alloc_hint: Mutex<u32>,
    /// Volume-wide operation lock: reads share it, mutations are exclusive.
    pub(crate) op_lock: RwLock<()>,
}

impl FatFs {
    /// Parse the boot sector and prepare the engine. The device must carry
    /// a FAT32 filesystem with 512-byte sectors.
    pub fn mount(dev: Arc<SectorDevice>) -> Result<Self> {
        let sector0 = dev.read_sector(0)?;
        let boot = BootSector::parse(&sector0)?;
        if !boot.is_fat32() {
            return Err(VeilError::Corrupt(
                "filesystem is not FAT32".to_owned(),
            ));
        }
        if boot.bytes_per_sector != 512 {
            return Err(VeilError::Corrupt(format!(
                "unsupported bytes per sector: {}",
                boot.bytes_per_sector
            )));
        }

        debug!(
            target: "veil::fat",
            event = "mount",
            total_sectors = boot.total_sectors,
            sectors_per_cluster = boot.sectors_per_cluster,
            sectors_per_fat = boot.sectors_per_fat
        );

        Ok(Self {
            dev,
            boot,
            caches: Caches::new(),
            alloc_hint: Mutex::new(veil_ondisk::FIRST_DATA_CLUSTER),
            op_lock: RwLock::new(()),
        })
    }

    /// Parsed boot-sector geometry.
    #[must_use]
    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    /// Cluster size in bytes.
    #[must_use]
    pub fn cluster_size(&self) -> u64 {
        u64::from(self.boot.cluster_size())
    }

    /// Total data capacity in bytes.
    #[must_use]
    pub fn total_space(&self) -> u64 {
        u64::from(self.boot.cluster_count()) * self.cluster_size()
    }

    /// Synthesised entry for the root directory.
    pub(crate) fn root_entry(&self) -> FileEntry {
        FileEntry {
            name: String::new(),
            path: "/".to_owned(),
            is_directory: true,
            size: 0,
            last_modified: 0,
            first_cluster: self.boot.root_dir_first_cluster,
        }
    }
}

// ── Path handling ───────────────────────────────────────────────────────────

/// Normalise a path for cache keys and comparisons: leading `/`, trailing
/// `/` stripped, lowercased. The root normalises to `"/"`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_owned();
    }
    let mut out = String::with_capacity(trimmed.len() + 1);
    if !trimmed.starts_with('/') {
        out.push('/');
    }
    out.push_str(&trimmed.to_lowercase());
    out
}

/// Iterate the non-empty components of a path.
pub(crate) fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Join a directory path and a child name.
#[must_use]
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" || dir.is_empty() {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split a path into `(parent, name)`.
pub(crate) fn split_path(path: &str) -> Result<(String, String)> {
    let norm = path.trim().trim_end_matches('/');
    if norm.is_empty() {
        return Err(VeilError::InvalidArgument(
            "the root directory has no parent".to_owned(),
        ));
    }
    match norm.rfind('/') {
        Some(pos) => {
            let parent = if pos == 0 { "/" } else { &norm[..pos] };
            Ok((parent.to_owned(), norm[pos + 1..].to_owned()))
        }
        None => Ok(("/".to_owned(), norm.to_owned())),
    }
}

/// Validate a name for entry creation.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VeilError::InvalidArgument("empty name".to_owned()));
    }
    if name.contains('/') {
        return Err(VeilError::InvalidArgument(format!(
            "name contains a path separator: {name}"
        )));
    }
    if name == "." || name == ".." {
        return Err(VeilError::InvalidArgument(format!(
            "reserved name: {name}"
        )));
    }
    if name.encode_utf16().count() > 255 {
        return Err(VeilError::InvalidArgument(format!(
            "name too long: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/Docs/"), "/docs");
        assert_eq!(normalize_path("Docs/Inner"), "/docs/inner");
        assert_eq!(normalize_path("/A/B/"), "/a/b");
    }

    #[test]
    fn split_parent_and_name() {
        assert_eq!(
            split_path("/a/b/c").unwrap(),
            ("/a/b".to_owned(), "c".to_owned())
        );
        assert_eq!(split_path("/top").unwrap(), ("/".to_owned(), "top".to_owned()));
        assert_eq!(split_path("plain").unwrap(), ("/".to_owned(), "plain".to_owned()));
        assert!(split_path("/").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        let long: String = std::iter::repeat('x').take(256).collect();
        assert!(validate_name(&long).is_err());
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join_path("/", "file"), "/file");
        assert_eq!(join_path("/dir", "file"), "/dir/file");
    }
}
