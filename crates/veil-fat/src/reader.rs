//! Read path: FAT lookups, chain walking, directory listing, file reads.

use crate::{join_path, normalize_path, path_components, FileEntry, FatFs};
use std::io::Write;
use std::sync::Arc;
use tracing::trace;
use veil_error::{Result, VeilError};
use veil_ondisk::dirent::{
    lfn_checksum, lfn_units, ShortEntry, ATTR_LONG_NAME, ATTR_VOLUME_ID, DIR_ENTRY_SIZE,
    ENTRY_DELETED, ENTRY_END,
};
use veil_ondisk::{is_end_of_chain, FAT_ENTRY_MASK, FIRST_DATA_CLUSTER};
use veil_types::read_le_u32;

use crate::cache::FAT_PREFETCH_SECTORS;

/// Cap on a coalesced run for whole-file reads (keeps decrypt scratch
/// bounded at 1 MiB with 4 KiB clusters).
const FULL_READ_RUN_CAP: usize = 256;

/// Tighter run cap for random-access ranged reads.
const RANGE_READ_RUN_CAP: usize = 64;

/// A directory slot hit: the assembled entry plus where its on-disk
/// entries live (LFN run first, 8.3 entry last).
pub(crate) struct ScannedEntry {
    pub(crate) file: FileEntry,
    pub(crate) short: ShortEntry,
    pub(crate) positions: Vec<(u32, usize)>,
}

impl FatFs {
    // ── FAT access ──────────────────────────────────────────────────────

    /// Fetch one FAT sector (index relative to the first FAT copy),
    /// prefetching a run on a miss.
    pub(crate) fn fat_sector(&self, index: u64) -> Result<Vec<u8>> {
        let spf = u64::from(self.boot.sectors_per_fat);
        if index >= spf {
            return Err(VeilError::Corrupt(format!(
                "FAT sector {index} beyond FAT size {spf}"
            )));
        }
        if let Some(hit) = self.caches.fat.lock().get(index) {
            return Ok(hit);
        }

        let count = FAT_PREFETCH_SECTORS.min(spf - index);
        let run = self
            .dev
            .read_sectors(self.boot.fat_start_sector() + index, count)?;
        trace!(
            target: "veil::fat",
            event = "fat_prefetch",
            index = index,
            count = count
        );

        let mut cache = self.caches.fat.lock();
        for (i, sector) in run.chunks_exact(512).enumerate() {
            cache.insert(index + i as u64, sector.to_vec());
        }
        drop(cache);

        Ok(run[..512].to_vec())
    }

    /// FAT entry for `cluster`, masked to 28 bits.
    pub(crate) fn fat_entry(&self, cluster: u32) -> Result<u32> {
        if cluster > self.boot.max_cluster() {
            return Err(VeilError::Corrupt(format!(
                "cluster {cluster} beyond FAT (max {})",
                self.boot.max_cluster()
            )));
        }
        let byte_offset = u64::from(cluster) * 4;
        let sector = self.fat_sector(byte_offset / 512)?;
        let value = read_le_u32(&sector, (byte_offset % 512) as usize)?;
        Ok(value & FAT_ENTRY_MASK)
    }

    /// Walk the cluster chain from `first`. An empty chain is returned for
    /// cluster numbers below 2 (empty files).
    pub(crate) fn cluster_chain(&self, first: u32) -> Result<Arc<Vec<u32>>> {
        if first < FIRST_DATA_CLUSTER {
            return Ok(Arc::new(Vec::new()));
        }
        if let Some(hit) = self.caches.chain(first) {
            return Ok(hit);
        }

        let limit = self.boot.cluster_count() as usize;
        let mut chain = Vec::new();
        let mut current = first;
        loop {
            chain.push(current);
            if chain.len() > limit {
                return Err(VeilError::Corrupt(format!(
                    "cluster chain from {first} exceeds cluster count (cycle?)"
                )));
            }
            let next = self.fat_entry(current)?;
            if is_end_of_chain(next) {
                break;
            }
            if next < FIRST_DATA_CLUSTER || next > self.boot.max_cluster() {
                return Err(VeilError::Corrupt(format!(
                    "invalid FAT entry {next:#x} after cluster {current}"
                )));
            }
            current = next;
        }

        let chain = Arc::new(chain);
        self.caches.store_chain(first, Arc::clone(&chain));
        Ok(chain)
    }

    /// Read one whole cluster as a single multi-sector request.
    pub(crate) fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>> {
        self.dev.read_sectors(
            self.boot.cluster_to_sector(cluster),
            u64::from(self.boot.sectors_per_cluster),
        )
    }

    // ── Directory scanning ──────────────────────────────────────────────

    /// Walk a directory's clusters, assembling long names. A `0x00` first
    /// byte ends the current cluster only; scanning continues along the
    /// chain, which tolerates trimmed directory growth.
    pub(crate) fn scan_dir(&self, dir: &FileEntry) -> Result<Vec<ScannedEntry>> {
        let chain = self.cluster_chain(dir.first_cluster)?;
        let mut out = Vec::new();

        let mut lfn_acc: Vec<u16> = Vec::new();
        let mut lfn_positions: Vec<(u32, usize)> = Vec::new();
        let mut lfn_sum: Option<u8> = None;

        for &cluster in chain.iter() {
            let data = self.read_cluster(cluster)?;
            for (slot, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                match raw[0] {
                    ENTRY_END => break,
                    ENTRY_DELETED => {
                        lfn_acc.clear();
                        lfn_positions.clear();
                        lfn_sum = None;
                    }
                    _ if raw[11] == ATTR_LONG_NAME => {
                        // LFN entries appear highest-ordinal first; prepend
                        // each fragment to rebuild the name in order.
                        let mut chunk = lfn_units(raw);
                        chunk.extend(lfn_acc.drain(..));
                        lfn_acc = chunk;
                        lfn_positions.push((cluster, slot));
                        lfn_sum = Some(lfn_checksum(raw));
                    }
                    _ if raw[11] & ATTR_VOLUME_ID != 0 => {
                        lfn_acc.clear();
                        lfn_positions.clear();
                        lfn_sum = None;
                    }
                    _ => {
                        let short = ShortEntry::parse(raw)?;
                        let short_name = short.name_string();

                        let use_lfn = !lfn_acc.is_empty();
                        if use_lfn && lfn_sum != Some(short.checksum()) {
                            return Err(VeilError::Corrupt(format!(
                                "long-name checksum mismatch before entry {short_name} in {}",
                                dir.path
                            )));
                        }
                        let name = if use_lfn {
                            String::from_utf16_lossy(&lfn_acc)
                        } else {
                            short_name.clone()
                        };

                        let mut positions = std::mem::take(&mut lfn_positions);
                        positions.push((cluster, slot));
                        lfn_acc.clear();
                        lfn_sum = None;

                        if short_name == "." || short_name == ".." {
                            continue;
                        }

                        out.push(ScannedEntry {
                            file: FileEntry {
                                path: join_path(&dir.path, &name),
                                is_directory: short.is_directory(),
                                size: if short.is_directory() {
                                    0
                                } else {
                                    u64::from(short.size)
                                },
                                last_modified: short.modified_unix(),
                                first_cluster: short.first_cluster & FAT_ENTRY_MASK,
                                name,
                            },
                            short,
                            positions,
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    /// Cached directory listing. Concurrent listers of the same directory
    /// collapse onto one underlying read via a per-path lock.
    pub(crate) fn dir_entries(&self, dir: &FileEntry) -> Result<Arc<Vec<FileEntry>>> {
        let norm = normalize_path(&dir.path);
        let path_lock = self.caches.listing_lock(&norm);
        let _guard = path_lock.lock();

        if let Some(hit) = self.caches.listing(&norm) {
            return Ok(hit);
        }

        let entries: Vec<FileEntry> =
            self.scan_dir(dir)?.into_iter().map(|s| s.file).collect();
        let entries = Arc::new(entries);
        self.caches.store_listing(norm, Arc::clone(&entries));
        Ok(entries)
    }

    /// Resolve a path to its entry, component by component,
    /// case-insensitively. The root resolves to a synthesised entry.
    pub(crate) fn resolve(&self, path: &str) -> Result<FileEntry> {
        let mut current = self.root_entry();
        for component in path_components(path) {
            if !current.is_directory {
                return Err(VeilError::NotADirectory(current.path));
            }
            let entries = self.dir_entries(&current)?;
            let lower = component.to_lowercase();
            match entries.iter().find(|e| e.name.to_lowercase() == lower) {
                Some(found) => current = found.clone(),
                None => return Err(VeilError::NotFound(path.to_owned())),
            }
        }
        Ok(current)
    }

    // ── Public read API ─────────────────────────────────────────────────

    /// List a directory. `.` and `..` are never reported.
    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let _op = self.op_lock.read();
        let dir = self.resolve(path)?;
        if !dir.is_directory {
            return Err(VeilError::NotADirectory(path.to_owned()));
        }
        Ok(self.dir_entries(&dir)?.as_ref().clone())
    }

    /// Entry metadata for a path.
    pub fn stat(&self, path: &str) -> Result<FileEntry> {
        let _op = self.op_lock.read();
        self.resolve(path)
    }

    /// Whether a path resolves.
    pub fn exists(&self, path: &str) -> bool {
        let _op = self.op_lock.read();
        self.resolve(path).is_ok()
    }

    /// Read a whole file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let _op = self.op_lock.read();
        let entry = self.resolve(path)?;
        if entry.is_directory {
            return Err(VeilError::NotAFile(path.to_owned()));
        }
        let chain = self.cluster_chain(entry.first_cluster)?;

        let mut out = Vec::with_capacity(entry.size as usize);
        for (start, count) in coalesce_runs(&chain, FULL_READ_RUN_CAP) {
            let run = self.dev.read_sectors(
                self.boot.cluster_to_sector(start),
                u64::from(count) * u64::from(self.boot.sectors_per_cluster),
            )?;
            out.extend_from_slice(&run);
            if out.len() as u64 >= entry.size {
                break;
            }
        }
        out.truncate(entry.size as usize);
        Ok(out)
    }

    /// Read `length` bytes starting at `offset`, touching only the
    /// clusters that cover the window.
    pub fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let _op = self.op_lock.read();
        let entry = self.resolve(path)?;
        if entry.is_directory {
            return Err(VeilError::NotAFile(path.to_owned()));
        }
        if offset >= entry.size || length == 0 {
            return Ok(Vec::new());
        }
        let end = entry.size.min(offset.saturating_add(length));

        let cs = self.cluster_size();
        let first_idx = (offset / cs) as usize;
        let last_idx = ((end - 1) / cs) as usize;

        let chain = self.cluster_chain(entry.first_cluster)?;
        if last_idx >= chain.len() {
            return Err(VeilError::Corrupt(format!(
                "cluster chain shorter than file size for {path}"
            )));
        }
        let window = &chain[first_idx..=last_idx];

        let mut assembled =
            Vec::with_capacity(window.len() * cs as usize);
        for (start, count) in coalesce_runs(window, RANGE_READ_RUN_CAP) {
            let run = self.dev.read_sectors(
                self.boot.cluster_to_sector(start),
                u64::from(count) * u64::from(self.boot.sectors_per_cluster),
            )?;
            assembled.extend_from_slice(&run);
        }

        let skip = (offset - first_idx as u64 * cs) as usize;
        let take = (end - offset) as usize;
        Ok(assembled[skip..skip + take].to_vec())
    }

    /// Stream a file into `sink` without materialising it. A sink that
    /// closes early ends the stream without error; the return value is the
    /// number of bytes delivered.
    pub fn stream(&self, path: &str, sink: &mut dyn Write) -> Result<u64> {
        let _op = self.op_lock.read();
        let entry = self.resolve(path)?;
        if entry.is_directory {
            return Err(VeilError::NotAFile(path.to_owned()));
        }
        let chain = self.cluster_chain(entry.first_cluster)?;

        let mut remaining = entry.size;
        let mut delivered = 0_u64;
        for (start, count) in coalesce_runs(&chain, FULL_READ_RUN_CAP) {
            if remaining == 0 {
                break;
            }
            let run = self.dev.read_sectors(
                self.boot.cluster_to_sector(start),
                u64::from(count) * u64::from(self.boot.sectors_per_cluster),
            )?;
            let take = (run.len() as u64).min(remaining) as usize;
            match sink.write_all(&run[..take]) {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::WriteZero
                    ) =>
                {
                    return Ok(delivered);
                }
                Err(e) => return Err(VeilError::Io(e)),
            }
            delivered += take as u64;
            remaining -= take as u64;
        }
        Ok(delivered)
    }

    /// Free space in bytes, from the cached FAT scan.
    pub fn free_space(&self) -> Result<u64> {
        let _op = self.op_lock.read();
        self.free_space_inner()
    }

    pub(crate) fn free_space_inner(&self) -> Result<u64> {
        if let Some(clusters) = self.caches.free_clusters() {
            return Ok(clusters * self.cluster_size());
        }

        let max = self.boot.max_cluster();
        let mut free = 0_u64;
        for index in 0..u64::from(self.boot.sectors_per_fat) {
            let sector = self.fat_sector(index)?;
            for j in 0..(512 / 4) {
                let cluster = index * 128 + j;
                if cluster < u64::from(FIRST_DATA_CLUSTER) || cluster > u64::from(max) {
                    continue;
                }
                if read_le_u32(&sector, (j * 4) as usize)? & FAT_ENTRY_MASK == 0 {
                    free += 1;
                }
            }
        }
        self.caches.set_free_clusters(free);
        Ok(free * self.cluster_size())
    }
}

/// Coalesce a cluster list into runs of consecutive clusters, each capped
/// at `max_run` clusters.
pub(crate) fn coalesce_runs(chain: &[u32], max_run: usize) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut iter = chain.iter().copied();
    let Some(first) = iter.next() else {
        return runs;
    };
    let mut start = first;
    let mut len = 1_u32;

    for cluster in iter {
        if cluster == start + len && (len as usize) < max_run {
            len += 1;
        } else {
            runs.push((start, len));
            start = cluster;
            len = 1;
        }
    }
    runs.push((start, len));
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_coalesce_consecutive_clusters() {
        assert_eq!(
            coalesce_runs(&[2, 3, 4, 7, 8, 10], 256),
            vec![(2, 3), (7, 2), (10, 1)]
        );
    }

    #[test]
    fn runs_respect_the_cap() {
        let chain: Vec<u32> = (2..12).collect();
        assert_eq!(coalesce_runs(&chain, 4), vec![(2, 4), (6, 4), (10, 2)]);
    }

    #[test]
    fn empty_chain_has_no_runs() {
        assert!(coalesce_runs(&[], 256).is_empty());
    }
}
