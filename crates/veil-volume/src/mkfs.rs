//! FAT32 formatting of a fresh data area.
//!
//! Everything goes through the sector device, so the metadata lands
//! encrypted with the volume master key. The whole metadata region is
//! written explicitly — a fresh container is ciphertext-random underneath,
//! and any sector the filesystem may read before writing must decrypt to
//! its formatted content.

use veil_block::SectorDevice;
use veil_error::{Result, VeilError};
use veil_ondisk::boot::{build_fsinfo, build_signed_reserved_sector, BootSector, BootSectorParams};
use veil_ondisk::{FAT_EOC, FAT_EOC_MIN};
use veil_types::{put_le_u32, SECTOR_SIZE};

/// Sectors per cluster for freshly formatted volumes (4 KiB clusters).
const SECTORS_PER_CLUSTER: u8 = 8;

/// Reserved sectors ahead of the first FAT copy.
const RESERVED_SECTORS: u16 = 32;

/// Zeroing writes move at most this many sectors at once.
const ZERO_BATCH_SECTORS: u64 = 2048;

/// Fixpoint computation of the FAT size: the FAT must cover every cluster
/// that remains after the FATs themselves are carved out.
fn sectors_per_fat(total_sectors: u32) -> Result<u32> {
    let reserved = u32::from(RESERVED_SECTORS);
    let spc = u32::from(SECTORS_PER_CLUSTER);
    let mut spf = 1_u32;
    loop {
        let data_sectors = total_sectors
            .checked_sub(reserved + 2 * spf)
            .ok_or_else(|| {
                VeilError::InvalidArgument("volume too small for a FAT32 layout".to_owned())
            })?;
        let clusters = data_sectors / spc;
        if clusters == 0 {
            return Err(VeilError::InvalidArgument(
                "volume too small for a FAT32 layout".to_owned(),
            ));
        }
        let needed = ((clusters + 2) * 4).div_ceil(SECTOR_SIZE as u32);
        if needed <= spf {
            return Ok(spf);
        }
        spf = needed;
    }
}

/// Lay down a standard FAT32 filesystem on the data area.
pub(crate) fn format_volume(dev: &SectorDevice, label: &str) -> Result<()> {
    let total_sectors = u32::try_from(dev.sector_count()).map_err(|_| {
        VeilError::InvalidArgument("data area exceeds FAT32 addressing".to_owned())
    })?;
    let spf = sectors_per_fat(total_sectors)?;
    let params = BootSectorParams {
        total_sectors,
        sectors_per_cluster: SECTORS_PER_CLUSTER,
        reserved_sectors: RESERVED_SECTORS,
        sectors_per_fat: spf,
        volume_label: label.to_owned(),
    };
    let boot = BootSector::build(&params);
    let parsed = BootSector::parse(&boot)?;
    let cluster_count = parsed.cluster_count();

    // Zero the whole metadata region plus the root cluster: reserved
    // sectors, both FATs, and cluster 2.
    let metadata_sectors = u64::from(RESERVED_SECTORS)
        + 2 * u64::from(spf)
        + u64::from(SECTORS_PER_CLUSTER);
    let mut cursor = 0_u64;
    while cursor < metadata_sectors {
        let batch = ZERO_BATCH_SECTORS.min(metadata_sectors - cursor);
        let zeros = vec![0_u8; (batch * SECTOR_SIZE as u64) as usize];
        dev.write_sectors(cursor, &zeros)?;
        cursor += batch;
    }

    // Reserved region: boot, FSInfo, signed filler, backups.
    let fsinfo = build_fsinfo(cluster_count.saturating_sub(1), 3);
    let signed = build_signed_reserved_sector();
    dev.write_sector(0, &boot)?;
    dev.write_sector(1, &fsinfo)?;
    for sector in 2..=5 {
        dev.write_sector(sector, &signed)?;
    }
    dev.write_sector(6, &boot)?;
    dev.write_sector(7, &fsinfo)?;

    // First FAT sector: media entry, reserved entry, root-directory EOC.
    let mut fat0 = [0_u8; SECTOR_SIZE];
    put_le_u32(&mut fat0, 0, FAT_EOC_MIN); // 0x0FFFFFF8: media descriptor entry
    put_le_u32(&mut fat0, 4, FAT_EOC);
    put_le_u32(&mut fat0, 8, FAT_EOC); // cluster 2: root directory
    let fat_start = u64::from(RESERVED_SECTORS);
    dev.write_sector(fat_start, &fat0)?;
    dev.write_sector(fat_start + u64::from(spf), &fat0)?;

    Ok(())
}
