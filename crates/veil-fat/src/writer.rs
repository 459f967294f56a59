//! Write path: allocation, chain mutation, entry creation and deletion.
//!
//! Every FAT mutation is batched by FAT sector and mirrored to both FAT
//! copies before the caller observes completion. If an operation fails
//! after its chain is linked but before the directory entry lands, the
//! clusters are leaked rather than rolled back; a free-space rescan
//! recovers the count.

use crate::reader::{coalesce_runs, ScannedEntry};
use crate::{join_path, normalize_path, split_path, validate_name, FatFs, FileEntry};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use veil_error::{Result, VeilError};
use veil_ondisk::dirent::{
    derive_short_name, encode_lfn_entries, encode_short_entry, encode_timestamp,
    short_name_checksum, ATTR_ARCHIVE, ATTR_DIRECTORY, DIR_ENTRY_SIZE, ENTRY_DELETED, ENTRY_END,
};
use veil_ondisk::{FAT_ENTRY_MASK, FAT_EOC, FAT_FREE, FIRST_DATA_CLUSTER};
use veil_types::{put_le_u16, put_le_u32, read_le_u32};

/// Streaming writes move at most this many clusters per batch.
const WRITE_BATCH_CLUSTERS: usize = 64;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Fill `buf` from `source`, failing on early end-of-input.
fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(VeilError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "source ended before the declared size",
            )));
        }
        filled += n;
    }
    Ok(())
}

impl FatFs {
    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate `count` free clusters, scanning forward from the rolling
    /// hint and wrapping once. Nothing is marked in the FAT here; the
    /// caller links the chain.
    pub(crate) fn allocate_clusters(&self, count: usize) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let max = self.boot.max_cluster();
        let mut hint = self.alloc_hint.lock();
        let start = (*hint).clamp(FIRST_DATA_CLUSTER, max);

        let mut found = Vec::with_capacity(count);
        for cluster in (start..=max).chain(FIRST_DATA_CLUSTER..start) {
            if self.fat_entry(cluster)? == FAT_FREE {
                found.push(cluster);
                if found.len() == count {
                    break;
                }
            }
        }
        if found.len() < count {
            debug!(
                target: "veil::fat::alloc",
                event = "disk_full",
                requested = count,
                available = found.len()
            );
            return Err(VeilError::DiskFull);
        }

        if let Some(&last) = found.last() {
            *hint = if last >= max { FIRST_DATA_CLUSTER } else { last + 1 };
        }
        Ok(found)
    }

    // ── FAT mutation ────────────────────────────────────────────────────

    /// Apply `(cluster, value)` updates, batched by FAT sector, writing
    /// each modified sector to both FAT copies and refreshing the cache.
    /// The reserved top nibble of each entry is preserved.
    pub(crate) fn write_fat_entries(&self, updates: &[(u32, u32)]) -> Result<()> {
        let mut by_sector: BTreeMap<u64, Vec<(usize, u32)>> = BTreeMap::new();
        for &(cluster, value) in updates {
            let byte_offset = u64::from(cluster) * 4;
            by_sector
                .entry(byte_offset / 512)
                .or_default()
                .push(((byte_offset % 512) as usize, value));
        }

        let fat_start = self.boot.fat_start_sector();
        let spf = u64::from(self.boot.sectors_per_fat);
        for (index, edits) in by_sector {
            let mut sector = self.fat_sector(index)?;
            for (offset, value) in edits {
                let old = read_le_u32(&sector, offset)?;
                put_le_u32(
                    &mut sector,
                    offset,
                    (old & !FAT_ENTRY_MASK) | (value & FAT_ENTRY_MASK),
                );
            }
            self.dev.write_sectors(fat_start + index, &sector)?;
            self.dev.write_sectors(fat_start + spf + index, &sector)?;
            self.caches.fat.lock().insert(index, sector);
        }
        Ok(())
    }

    /// Link freshly allocated clusters into a chain ending in EOC.
    pub(crate) fn link_chain(&self, clusters: &[u32]) -> Result<()> {
        if clusters.is_empty() {
            return Ok(());
        }
        let mut updates: Vec<(u32, u32)> = clusters
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        if let Some(&last) = clusters.last() {
            updates.push((last, FAT_EOC));
        }
        self.write_fat_entries(&updates)?;
        self.caches
            .adjust_free_clusters(-i64::try_from(clusters.len()).unwrap_or(i64::MAX));
        Ok(())
    }

    /// Free a whole chain. The chain is walked (successors recorded)
    /// before any entry is overwritten.
    pub(crate) fn free_chain(&self, first: u32) -> Result<()> {
        if first < FIRST_DATA_CLUSTER {
            return Ok(());
        }
        let chain = self.cluster_chain(first)?;
        let updates: Vec<(u32, u32)> = chain.iter().map(|&c| (c, FAT_FREE)).collect();
        self.write_fat_entries(&updates)?;
        self.caches.invalidate_chain(first);
        self.caches
            .adjust_free_clusters(i64::try_from(chain.len()).unwrap_or(0));
        Ok(())
    }

    // ── Cluster payload ─────────────────────────────────────────────────

    fn zero_cluster(&self, cluster: u32) -> Result<()> {
        let zeros = vec![0_u8; self.cluster_size() as usize];
        self.dev
            .write_sectors(self.boot.cluster_to_sector(cluster), &zeros)
    }

    /// Write `data` across a chain, one multi-sector write per coalesced
    /// run; the final cluster is zero-padded.
    fn write_chain_payload(&self, chain: &[u32], data: &[u8]) -> Result<()> {
        let cs = self.cluster_size() as usize;
        let mut offset = 0_usize;
        for (start, count) in coalesce_runs(chain, WRITE_BATCH_CLUSTERS) {
            let run_bytes = count as usize * cs;
            let mut buf = vec![0_u8; run_bytes];
            let take = (data.len() - offset).min(run_bytes);
            buf[..take].copy_from_slice(&data[offset..offset + take]);
            offset += take;
            self.dev
                .write_sectors(self.boot.cluster_to_sector(start), &buf)?;
        }
        Ok(())
    }

    // ── Directory slots ─────────────────────────────────────────────────

    /// Find `needed` consecutive free slots in a directory, appending a
    /// zeroed cluster to the chain when the existing clusters have no run
    /// of that length.
    fn find_slot_run(&self, dir: &FileEntry, needed: usize) -> Result<Vec<(u32, usize)>> {
        let chain = self.cluster_chain(dir.first_cluster)?;
        let mut run: Vec<(u32, usize)> = Vec::new();

        for &cluster in chain.iter() {
            let data = self.read_cluster(cluster)?;
            for (slot, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                if raw[0] == ENTRY_END || raw[0] == ENTRY_DELETED {
                    run.push((cluster, slot));
                    if run.len() == needed {
                        return Ok(run);
                    }
                } else {
                    run.clear();
                }
            }
            // A run at the end of one cluster continues into the next.
        }

        // Grow the directory by one zeroed cluster.
        let appended = self.allocate_clusters(1)?;
        let Some(&new_cluster) = appended.first() else {
            return Err(VeilError::DiskFull);
        };
        self.zero_cluster(new_cluster)?;
        let mut updates = vec![(new_cluster, FAT_EOC)];
        if let Some(&last) = chain.last() {
            updates.push((last, new_cluster));
        }
        self.write_fat_entries(&updates)?;
        self.caches.invalidate_chain(dir.first_cluster);
        self.caches.adjust_free_clusters(-1);
        debug!(
            target: "veil::fat",
            event = "dir_grow",
            dir = %dir.path,
            cluster = new_cluster
        );

        let mut slot = 0_usize;
        while run.len() < needed {
            run.push((new_cluster, slot));
            slot += 1;
        }
        Ok(run)
    }

    /// Write directory entries into the given slots, one cluster rewrite
    /// per affected cluster.
    fn write_dir_slots(
        &self,
        positions: &[(u32, usize)],
        entries: &[[u8; DIR_ENTRY_SIZE]],
    ) -> Result<()> {
        if positions.len() != entries.len() {
            return Err(VeilError::InvalidArgument(format!(
                "slot/entry count mismatch: {} vs {}",
                positions.len(),
                entries.len()
            )));
        }
        let mut by_cluster: BTreeMap<u32, Vec<(usize, usize)>> = BTreeMap::new();
        for (i, &(cluster, slot)) in positions.iter().enumerate() {
            by_cluster.entry(cluster).or_default().push((slot, i));
        }
        for (cluster, edits) in by_cluster {
            let mut data = self.read_cluster(cluster)?;
            for (slot, entry_idx) in edits {
                let offset = slot * DIR_ENTRY_SIZE;
                data[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&entries[entry_idx]);
            }
            self.dev
                .write_sectors(self.boot.cluster_to_sector(cluster), &data)?;
        }
        Ok(())
    }

    fn mark_slots_deleted(&self, positions: &[(u32, usize)]) -> Result<()> {
        let mut by_cluster: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for &(cluster, slot) in positions {
            by_cluster.entry(cluster).or_default().push(slot);
        }
        for (cluster, slots) in by_cluster {
            let mut data = self.read_cluster(cluster)?;
            for slot in slots {
                data[slot * DIR_ENTRY_SIZE] = ENTRY_DELETED;
            }
            self.dev
                .write_sectors(self.boot.cluster_to_sector(cluster), &data)?;
        }
        Ok(())
    }

    /// Locate an entry in a directory by name, case-insensitively against
    /// both the long and the 8.3 name.
    fn scan_for(&self, dir: &FileEntry, name: &str) -> Result<Option<ScannedEntry>> {
        let lower = name.to_lowercase();
        Ok(self.scan_dir(dir)?.into_iter().find(|s| {
            s.file.name.to_lowercase() == lower
                || s.short.name_string().to_lowercase() == lower
        }))
    }

    /// Patch an existing 8.3 entry's first cluster, size and mtime.
    fn update_short_entry(
        &self,
        hit: &ScannedEntry,
        first_cluster: u32,
        size: u32,
        unix_time: i64,
    ) -> Result<()> {
        let Some(&(cluster, slot)) = hit.positions.last() else {
            return Err(VeilError::Corrupt(
                "directory entry without a slot position".to_owned(),
            ));
        };
        let mut data = self.read_cluster(cluster)?;
        let offset = slot * DIR_ENTRY_SIZE;
        let (date, time) = encode_timestamp(unix_time);
        put_le_u16(&mut data, offset + 20, (first_cluster >> 16) as u16);
        put_le_u16(&mut data, offset + 22, time);
        put_le_u16(&mut data, offset + 24, date);
        put_le_u16(&mut data, offset + 26, (first_cluster & 0xFFFF) as u16);
        put_le_u32(&mut data, offset + 28, size);
        self.dev
            .write_sectors(self.boot.cluster_to_sector(cluster), &data)
    }

    // ── Public write API ────────────────────────────────────────────────

    /// Create an empty file in `parent`.
    pub fn create_file(&self, parent: &str, name: &str) -> Result<FileEntry> {
        let _op = self.op_lock.write();
        self.create_entry(parent, name, false)
    }

    /// Create a directory in `parent`, initialised with `.` and `..`.
    pub fn create_directory(&self, parent: &str, name: &str) -> Result<FileEntry> {
        let _op = self.op_lock.write();
        self.create_entry(parent, name, true)
    }

    fn create_entry(&self, parent: &str, name: &str, is_dir: bool) -> Result<FileEntry> {
        validate_name(name)?;
        let parent_entry = self.resolve(parent)?;
        if !parent_entry.is_directory {
            return Err(VeilError::NotADirectory(parent.to_owned()));
        }

        let lower = name.to_lowercase();
        let existing = self.scan_dir(&parent_entry)?;
        if existing.iter().any(|s| {
            s.file.name.to_lowercase() == lower
                || s.short.name_string().to_lowercase() == lower
        }) {
            return Err(VeilError::AlreadyExists(join_path(
                &parent_entry.path,
                name,
            )));
        }

        let now = unix_now();
        let short = derive_short_name(name);
        let checksum = short_name_checksum(&short.raw);
        let mut slots: Vec<[u8; DIR_ENTRY_SIZE]> = if short.needs_lfn {
            encode_lfn_entries(name, checksum)
        } else {
            Vec::new()
        };

        let first_cluster = if is_dir {
            let allocated = self.allocate_clusters(1)?;
            let Some(&cluster) = allocated.first() else {
                return Err(VeilError::DiskFull);
            };
            self.write_fat_entries(&[(cluster, FAT_EOC)])?;
            self.caches.adjust_free_clusters(-1);

            // `.` points at the new directory, `..` at the parent — with
            // the FAT32 convention of cluster 0 for a root parent.
            let parent_cluster = if normalize_path(&parent_entry.path) == "/" {
                0
            } else {
                parent_entry.first_cluster
            };
            let mut data = vec![0_u8; self.cluster_size() as usize];
            let dot = encode_short_entry(b".          ", ATTR_DIRECTORY, cluster, 0, now);
            let dotdot =
                encode_short_entry(b"..         ", ATTR_DIRECTORY, parent_cluster, 0, now);
            data[..DIR_ENTRY_SIZE].copy_from_slice(&dot);
            data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot);
            self.dev
                .write_sectors(self.boot.cluster_to_sector(cluster), &data)?;
            cluster
        } else {
            0
        };

        let attributes = if is_dir { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
        slots.push(encode_short_entry(
            &short.raw,
            attributes,
            first_cluster,
            0,
            now,
        ));

        let positions = self.find_slot_run(&parent_entry, slots.len())?;
        self.write_dir_slots(&positions, &slots)?;
        self.caches
            .invalidate_listing(&normalize_path(&parent_entry.path));

        debug!(
            target: "veil::fat",
            event = "create",
            path = %join_path(&parent_entry.path, name),
            directory = is_dir
        );
        Ok(FileEntry {
            name: name.to_owned(),
            path: join_path(&parent_entry.path, name),
            is_directory: is_dir,
            size: 0,
            last_modified: now,
            first_cluster,
        })
    }

    /// Replace a file's content. The old chain is freed, a fresh one is
    /// allocated and linked, the payload is written, then the directory
    /// entry is updated in place.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let _op = self.op_lock.write();
        let (parent, name) = split_path(path)?;
        let parent_entry = self.resolve(&parent)?;
        let Some(hit) = self.scan_for(&parent_entry, &name)? else {
            return Err(VeilError::NotFound(path.to_owned()));
        };
        if hit.file.is_directory {
            return Err(VeilError::NotAFile(path.to_owned()));
        }

        let old_first = hit.file.first_cluster;
        if old_first >= FIRST_DATA_CLUSTER {
            self.free_chain(old_first)?;
        }

        let cs = self.cluster_size() as usize;
        let needed = data.len().div_ceil(cs).max(1);
        let clusters = self.allocate_clusters(needed)?;
        self.link_chain(&clusters)?;
        self.write_chain_payload(&clusters, data)?;

        let size = u32::try_from(data.len()).map_err(|_| {
            VeilError::InvalidArgument("file larger than 4 GiB".to_owned())
        })?;
        self.update_short_entry(&hit, clusters[0], size, unix_now())?;

        self.caches
            .invalidate_listing(&normalize_path(&parent_entry.path));
        self.caches.invalidate_chain(old_first);
        self.caches.invalidate_chain(clusters[0]);
        Ok(())
    }

    /// Streaming variant of [`FatFs::write`]: the chain is allocated up
    /// front from the declared size, then the source is copied through in
    /// batches of at most 64 clusters, each landing as one multi-sector
    /// write per contiguous run. `progress` receives cumulative bytes.
    pub fn write_streaming(
        &self,
        path: &str,
        source: &mut dyn Read,
        size: u64,
        mut progress: impl FnMut(u64),
    ) -> Result<()> {
        let _op = self.op_lock.write();
        let (parent, name) = split_path(path)?;
        let parent_entry = self.resolve(&parent)?;
        let Some(hit) = self.scan_for(&parent_entry, &name)? else {
            return Err(VeilError::NotFound(path.to_owned()));
        };
        if hit.file.is_directory {
            return Err(VeilError::NotAFile(path.to_owned()));
        }
        let size_u32 = u32::try_from(size).map_err(|_| {
            VeilError::InvalidArgument("file larger than 4 GiB".to_owned())
        })?;

        let old_first = hit.file.first_cluster;
        if old_first >= FIRST_DATA_CLUSTER {
            self.free_chain(old_first)?;
        }

        let cs = self.cluster_size() as usize;
        let needed = usize::try_from(size.div_ceil(cs as u64))
            .map_err(|_| VeilError::InvalidArgument("size overflows".to_owned()))?
            .max(1);
        let clusters = self.allocate_clusters(needed)?;
        self.link_chain(&clusters)?;

        let mut remaining = size;
        let mut sent = 0_u64;
        for (start, count) in coalesce_runs(&clusters, WRITE_BATCH_CLUSTERS) {
            let run_bytes = count as usize * cs;
            let mut buf = vec![0_u8; run_bytes];
            let fill = (remaining as usize).min(run_bytes);
            read_full(source, &mut buf[..fill])?;
            self.dev
                .write_sectors(self.boot.cluster_to_sector(start), &buf)?;
            remaining -= fill as u64;
            sent += fill as u64;
            progress(sent);
        }

        self.update_short_entry(&hit, clusters[0], size_u32, unix_now())?;
        self.caches
            .invalidate_listing(&normalize_path(&parent_entry.path));
        self.caches.invalidate_chain(old_first);
        self.caches.invalidate_chain(clusters[0]);
        Ok(())
    }

    /// Delete a file or directory; directories are emptied recursively.
    /// The whole LFN run is marked deleted along with the 8.3 entry.
    pub fn delete(&self, path: &str) -> Result<()> {
        let _op = self.op_lock.write();
        if normalize_path(path) == "/" {
            return Err(VeilError::InvalidArgument(
                "cannot delete the root directory".to_owned(),
            ));
        }
        self.delete_inner(path)
    }

    fn delete_inner(&self, path: &str) -> Result<()> {
        let (parent, name) = split_path(path)?;
        let parent_entry = self.resolve(&parent)?;
        let Some(hit) = self.scan_for(&parent_entry, &name)? else {
            return Err(VeilError::NotFound(path.to_owned()));
        };

        if hit.file.is_directory {
            for child in self.scan_dir(&hit.file)? {
                self.delete_inner(&child.file.path)?;
            }
            self.caches
                .invalidate_listing(&normalize_path(&hit.file.path));
        }

        if hit.file.first_cluster >= FIRST_DATA_CLUSTER {
            self.free_chain(hit.file.first_cluster)?;
        }
        self.mark_slots_deleted(&hit.positions)?;

        self.caches
            .invalidate_listing(&normalize_path(&parent_entry.path));
        self.caches.invalidate_chain(hit.file.first_cluster);
        debug!(target: "veil::fat", event = "delete", path = %path);
        Ok(())
    }
}
