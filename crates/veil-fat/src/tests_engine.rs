//! Engine tests over a hand-built FAT32 image on an in-memory device.
//!
//! The image is written in plaintext *through* the sector device, so the
//! tests also cover the decrypt-on-read path end to end.

use crate::{FatFs, FileEntry};
use std::sync::Arc;
use veil_block::{MemByteDevice, SectorDevice};
use veil_crypto::XtsCodec;
use veil_error::VeilError;
use veil_ondisk::boot::{BootSector, BootSectorParams};
use veil_ondisk::dirent::{
    encode_lfn_entries, encode_short_entry, short_name_checksum, ATTR_ARCHIVE, ENTRY_DELETED,
};
use veil_ondisk::{FAT_EOC, FAT_EOC_MIN};
use veil_types::{put_le_u32, SECTOR_SIZE};

const RESERVED: u16 = 2;
const SPF: u32 = 16;
const FAT_START: u64 = RESERVED as u64;
const DATA_START: u64 = FAT_START + 2 * SPF as u64;

/// Build a minimal FAT32 volume: 512-byte clusters (16 entries per
/// directory cluster), two FAT copies, cluster 2 as the root directory.
fn test_fs(total_sectors: u32) -> FatFs {
    let bytes = u64::from(total_sectors) * SECTOR_SIZE as u64;
    let device = Arc::new(MemByteDevice::new(bytes));
    let xts = Arc::new(XtsCodec::new(&[0x21_u8; 64]).unwrap());
    let dev = Arc::new(SectorDevice::new(device, xts, 0, bytes).unwrap());

    let boot = BootSector::build(&BootSectorParams {
        total_sectors,
        sectors_per_cluster: 1,
        reserved_sectors: RESERVED,
        sectors_per_fat: SPF,
        volume_label: "test".to_owned(),
    });
    dev.write_sector(0, &boot).unwrap();

    // Zero both FATs, then seed the reserved entries and the root chain.
    let zeros = vec![0_u8; (2 * SPF as usize) * SECTOR_SIZE];
    dev.write_sectors(FAT_START, &zeros).unwrap();
    let mut fat0 = [0_u8; SECTOR_SIZE];
    put_le_u32(&mut fat0, 0, FAT_EOC_MIN);
    put_le_u32(&mut fat0, 4, FAT_EOC);
    put_le_u32(&mut fat0, 8, FAT_EOC); // root directory: cluster 2
    dev.write_sector(FAT_START, &fat0).unwrap();
    dev.write_sector(FAT_START + u64::from(SPF), &fat0).unwrap();

    // Zero the root cluster.
    dev.write_sector(DATA_START, &[0_u8; SECTOR_SIZE]).unwrap();

    FatFs::mount(dev).unwrap()
}

fn entry_names(entries: &[FileEntry]) -> Vec<String> {
    entries.iter().map(|e| e.name.clone()).collect()
}

#[test]
fn fresh_volume_has_empty_root() {
    let fs = test_fs(256);
    assert!(fs.list("/").unwrap().is_empty());
    assert!(fs.exists("/"));
    let root = fs.stat("/").unwrap();
    assert!(root.is_directory);
    assert_eq!(root.first_cluster, 2);
}

#[test]
fn create_write_read_round_trip() {
    let fs = test_fs(256);
    fs.create_file("/", "hello.txt").unwrap();
    fs.write("/hello.txt", b"hello world").unwrap();

    assert_eq!(fs.read("/hello.txt").unwrap(), b"hello world");
    let stat = fs.stat("/hello.txt").unwrap();
    assert_eq!(stat.size, 11);
    assert!(!stat.is_directory);
    assert!(stat.first_cluster >= 2);
}

#[test]
fn empty_file_reads_empty() {
    let fs = test_fs(256);
    let entry = fs.create_file("/", "empty").unwrap();
    assert_eq!(entry.first_cluster, 0);
    assert_eq!(fs.read("/empty").unwrap(), Vec::<u8>::new());
    assert_eq!(fs.stat("/empty").unwrap().size, 0);
}

#[test]
fn resolution_is_case_insensitive_but_listing_preserves_case() {
    let fs = test_fs(256);
    fs.create_file("/", "MixedCase.TXT").unwrap();
    assert!(fs.exists("/mixedcase.txt"));
    assert!(fs.exists("/MIXEDCASE.TXT"));
    assert_eq!(entry_names(&fs.list("/").unwrap()), vec!["MixedCase.TXT"]);
}

#[test]
fn create_rejects_case_variants_and_bad_names() {
    let fs = test_fs(256);
    fs.create_file("/", "File.txt").unwrap();
    assert!(matches!(
        fs.create_file("/", "file.TXT"),
        Err(VeilError::AlreadyExists(_))
    ));
    assert!(matches!(
        fs.create_file("/", ""),
        Err(VeilError::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.create_file("/", "a/b"),
        Err(VeilError::InvalidArgument(_))
    ));
}

#[test]
fn directories_nest_and_list() {
    let fs = test_fs(512);
    fs.create_directory("/", "docs").unwrap();
    fs.create_directory("/docs", "inner").unwrap();
    fs.create_file("/docs/inner", "deep.txt").unwrap();
    fs.write("/docs/inner/deep.txt", b"deep").unwrap();

    assert_eq!(fs.read("/docs/inner/deep.txt").unwrap(), b"deep");
    assert_eq!(entry_names(&fs.list("/docs").unwrap()), vec!["inner"]);
    // `.` and `..` are filtered from listings.
    assert_eq!(entry_names(&fs.list("/docs/inner").unwrap()), vec!["deep.txt"]);

    assert!(matches!(
        fs.list("/docs/inner/deep.txt"),
        Err(VeilError::NotADirectory(_))
    ));
    assert!(matches!(
        fs.read("/docs"),
        Err(VeilError::NotAFile(_))
    ));
}

#[test]
fn overwrite_replaces_chain_and_size() {
    let fs = test_fs(512);
    fs.create_file("/", "grow.bin").unwrap();

    let big: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    fs.write("/grow.bin", &big).unwrap();
    assert_eq!(fs.read("/grow.bin").unwrap(), big);
    assert_eq!(fs.stat("/grow.bin").unwrap().size, 3000);

    fs.write("/grow.bin", b"tiny").unwrap();
    assert_eq!(fs.read("/grow.bin").unwrap(), b"tiny");
    assert_eq!(fs.stat("/grow.bin").unwrap().size, 4);
}

#[test]
fn ranged_reads_slice_the_file() {
    let fs = test_fs(512);
    fs.create_file("/", "range.bin").unwrap();
    // Spans several 512-byte clusters.
    let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
    fs.write("/range.bin", &data).unwrap();

    assert_eq!(fs.read_range("/range.bin", 0, 16).unwrap(), &data[..16]);
    assert_eq!(
        fs.read_range("/range.bin", 500, 100).unwrap(),
        &data[500..600]
    );
    assert_eq!(
        fs.read_range("/range.bin", 2000, 500).unwrap(),
        &data[2000..]
    );
    assert!(fs.read_range("/range.bin", 5000, 10).unwrap().is_empty());
}

#[test]
fn streaming_read_delivers_all_bytes() {
    let fs = test_fs(512);
    fs.create_file("/", "stream.bin").unwrap();
    let data: Vec<u8> = (0..1500).map(|i| (i * 7 % 256) as u8).collect();
    fs.write("/stream.bin", &data).unwrap();

    let mut sink = Vec::new();
    let delivered = fs.stream("/stream.bin", &mut sink).unwrap();
    assert_eq!(delivered, 1500);
    assert_eq!(sink, data);
}

/// A sink that accepts a fixed number of bytes, then reports a broken pipe.
struct ClosingSink {
    capacity: usize,
    received: Vec<u8>,
}

impl std::io::Write for ClosingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.received.len() >= self.capacity {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        }
        let take = buf.len().min(self.capacity - self.received.len());
        self.received.extend_from_slice(&buf[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn closed_sink_ends_stream_without_error() {
    let fs = test_fs(512);
    fs.create_file("/", "partial.bin").unwrap();
    let data = vec![0xAB_u8; 2048];
    fs.write("/partial.bin", &data).unwrap();

    let mut sink = ClosingSink {
        capacity: 700,
        received: Vec::new(),
    };
    let delivered = fs.stream("/partial.bin", &mut sink).unwrap();
    assert!(delivered <= 2048);
    assert_eq!(&sink.received, &data[..sink.received.len()]);
}

#[test]
fn streaming_write_round_trips() {
    let fs = test_fs(512);
    fs.create_file("/", "src.bin").unwrap();
    let data: Vec<u8> = (0..4000).map(|i| (i % 249) as u8).collect();

    let mut seen = Vec::new();
    fs.write_streaming("/src.bin", &mut &data[..], 4000, |sent| seen.push(sent))
        .unwrap();
    assert_eq!(fs.read("/src.bin").unwrap(), data);
    assert_eq!(seen.last().copied(), Some(4000));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    // Declared size larger than the source fails cleanly.
    fs.create_file("/", "short.bin").unwrap();
    let tiny = [0_u8; 4];
    assert!(fs
        .write_streaming("/short.bin", &mut &tiny[..], 100, |_| {})
        .is_err());
}

#[test]
fn delete_recurses_and_frees_space() {
    let fs = test_fs(512);
    let free_before = fs.free_space().unwrap();

    fs.create_directory("/", "tree").unwrap();
    fs.create_file("/tree", "a.bin").unwrap();
    fs.write("/tree/a.bin", &[1_u8; 1024]).unwrap();
    fs.create_directory("/tree", "sub").unwrap();
    fs.create_file("/tree/sub", "b.bin").unwrap();
    fs.write("/tree/sub/b.bin", &[2_u8; 512]).unwrap();
    assert!(fs.free_space().unwrap() < free_before);

    fs.delete("/tree").unwrap();
    assert!(!fs.exists("/tree"));
    assert!(!fs.exists("/tree/sub/b.bin"));
    assert_eq!(fs.free_space().unwrap(), free_before);
}

#[test]
fn delete_create_leaves_a_clean_slate() {
    let fs = test_fs(512);
    fs.create_file("/", "cycle.txt").unwrap();
    fs.write("/cycle.txt", b"first").unwrap();
    fs.delete("/cycle.txt").unwrap();
    assert!(!fs.exists("/cycle.txt"));

    fs.create_file("/", "cycle.txt").unwrap();
    assert_eq!(fs.stat("/cycle.txt").unwrap().size, 0);
    assert_eq!(fs.read("/cycle.txt").unwrap(), Vec::<u8>::new());
    assert_eq!(entry_names(&fs.list("/").unwrap()), vec!["cycle.txt"]);
}

#[test]
fn deleting_a_long_name_marks_the_whole_lfn_run() {
    let fs = test_fs(512);
    fs.create_file("/", "a long deleted name.txt").unwrap();
    fs.delete("/a long deleted name.txt").unwrap();

    // 2 LFN entries + the 8.3 entry, all flagged 0xE5 at the head of the
    // root cluster.
    let root = fs.read_cluster(2).unwrap();
    for slot in 0..3 {
        assert_eq!(root[slot * 32], ENTRY_DELETED, "slot {slot}");
    }
    // The freed slots are reused by the next creation.
    fs.create_file("/", "another long-ish name.txt").unwrap();
    assert_eq!(
        entry_names(&fs.list("/").unwrap()),
        vec!["another long-ish name.txt"]
    );
}

#[test]
fn directory_grows_past_one_cluster() {
    let fs = test_fs(1024);
    // 16 slots per 512-byte cluster; short 8.3 names use one slot each,
    // so 40 files force repeated chain growth.
    for i in 0..40 {
        fs.create_file("/", &format!("F{i:03}")).unwrap();
    }
    let names = entry_names(&fs.list("/").unwrap());
    assert_eq!(names.len(), 40);
    for i in 0..40 {
        assert!(fs.exists(&format!("/f{i:03}")), "F{i:03} must resolve");
    }
    // The root chain now spans multiple clusters.
    assert!(fs.cluster_chain(2).unwrap().len() > 1);
}

#[test]
fn zero_first_byte_mid_chain_does_not_end_the_directory() {
    let fs = test_fs(512);

    // Hand-build a root spanning clusters 2 → 3 where cluster 2 holds one
    // entry followed by 0x00 slots and cluster 3 holds a second entry.
    fs.write_fat_entries(&[(2, 3), (3, FAT_EOC)]).unwrap();

    let mut cluster2 = vec![0_u8; SECTOR_SIZE];
    cluster2[..32].copy_from_slice(&encode_short_entry(b"FIRST   TXT", ATTR_ARCHIVE, 0, 0, 0));
    fs.dev.write_sector(DATA_START, &cluster2).unwrap();

    let mut cluster3 = vec![0_u8; SECTOR_SIZE];
    cluster3[..32].copy_from_slice(&encode_short_entry(b"SECOND  TXT", ATTR_ARCHIVE, 0, 0, 0));
    fs.dev.write_sector(DATA_START + 1, &cluster3).unwrap();
    fs.caches.invalidate_chain(2);

    let names = entry_names(&fs.list("/").unwrap());
    assert_eq!(names, vec!["FIRST.TXT", "SECOND.TXT"]);
}

#[test]
fn lfn_checksum_mismatch_is_corruption() {
    let fs = test_fs(256);

    // Hand-write an LFN run whose checksum does not match the 8.3 entry
    // it precedes. Listing must fail rather than fall back to the short
    // name.
    let raw_name = *b"MISMATC TXT";
    let wrong = short_name_checksum(&raw_name).wrapping_add(1);
    let lfn = encode_lfn_entries("mismatched name.txt", wrong);

    let mut cluster = vec![0_u8; SECTOR_SIZE];
    for (i, entry) in lfn.iter().enumerate() {
        cluster[i * 32..(i + 1) * 32].copy_from_slice(entry);
    }
    let short_slot = lfn.len();
    cluster[short_slot * 32..(short_slot + 1) * 32]
        .copy_from_slice(&encode_short_entry(&raw_name, ATTR_ARCHIVE, 0, 0, 0));
    fs.dev.write_sector(DATA_START, &cluster).unwrap();

    assert!(matches!(fs.list("/"), Err(VeilError::Corrupt(_))));
}

#[test]
fn allocation_exhaustion_reports_disk_full() {
    // Tiny volume: few data clusters.
    let fs = test_fs(64);
    let free = fs.free_space().unwrap();
    let clusters = free / fs.cluster_size();
    fs.create_file("/", "big.bin").unwrap();

    let too_big = vec![0_u8; ((clusters + 1) * fs.cluster_size()) as usize];
    assert!(matches!(
        fs.write("/big.bin", &too_big),
        Err(VeilError::DiskFull)
    ));

    // A fitting write still succeeds afterwards.
    let fits = vec![0_u8; fs.cluster_size() as usize];
    fs.write("/big.bin", &fits).unwrap();
    assert_eq!(fs.read("/big.bin").unwrap().len(), fits.len());
}

#[test]
fn allocator_hint_wraps_and_reuses_freed_clusters() {
    let fs = test_fs(96);
    fs.create_file("/", "a").unwrap();
    fs.create_file("/", "b").unwrap();

    // Fill most of the disk, free it, then allocate again: the cursor has
    // moved past the freed range and must wrap to find space.
    let free = fs.free_space().unwrap();
    let payload = vec![0x11_u8; (free - 2 * fs.cluster_size()) as usize];
    fs.write("/a", &payload).unwrap();
    fs.write("/a", b"small").unwrap();

    let big_again = vec![0x22_u8; (free / 2) as usize];
    fs.write("/b", &big_again).unwrap();
    assert_eq!(fs.read("/b").unwrap(), big_again);
}

#[test]
fn stat_size_matches_read_and_stream_lengths() {
    let fs = test_fs(512);
    fs.create_file("/", "sizes.bin").unwrap();
    let data = vec![0x5C_u8; 1777];
    fs.write("/sizes.bin", &data).unwrap();

    let stat = fs.stat("/sizes.bin").unwrap();
    assert_eq!(stat.size as usize, fs.read("/sizes.bin").unwrap().len());
    let mut sink = Vec::new();
    assert_eq!(fs.stream("/sizes.bin", &mut sink).unwrap(), stat.size);
}
