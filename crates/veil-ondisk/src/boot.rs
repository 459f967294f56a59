//! FAT32 boot sector and FSInfo codec.
//!
//! Parsing accepts any boot record with the `0x55AA` signature and sane
//! geometry, including FAT16-era records (16-bit total-sector and
//! sectors-per-FAT fields are used when the 32-bit ones are zero). The
//! engine itself mounts FAT32 only; tolerating FAT16 here keeps probing
//! from misreporting a valid disk as corrupt.

use serde::Serialize;
use veil_types::{
    ensure_slice, put_le_u16, put_le_u32, read_le_u16, read_le_u32, trim_space_padded, ParseError,
    SECTOR_SIZE,
};

/// Parsed boot-sector geometry, cached for the lifetime of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub number_of_fats: u8,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub root_dir_first_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
    pub volume_label: String,
    pub fs_type: String,
}

/// Geometry inputs for building a fresh FAT32 boot sector.
#[derive(Debug, Clone)]
pub struct BootSectorParams {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub sectors_per_fat: u32,
    pub volume_label: String,
}

impl BootSector {
    /// Parse sector 0 of a filesystem.
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        if sector.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: sector.len(),
            });
        }
        let sig = ensure_slice(sector, 510, 2)?;
        if sig != [0x55, 0xAA] {
            return Err(ParseError::InvalidField {
                field: "boot_signature",
                reason: "missing 0x55AA",
            });
        }

        let bytes_per_sector = read_le_u16(sector, 11)?;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be 512, 1024, 2048 or 4096",
            });
        }
        let sectors_per_cluster = sector[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a nonzero power of two",
            });
        }
        let reserved_sectors = read_le_u16(sector, 14)?;
        if reserved_sectors == 0 {
            return Err(ParseError::InvalidField {
                field: "reserved_sectors",
                reason: "must be nonzero",
            });
        }
        let number_of_fats = sector[16];
        if number_of_fats == 0 {
            return Err(ParseError::InvalidField {
                field: "number_of_fats",
                reason: "must be nonzero",
            });
        }

        // 32-bit fields with FAT16 fallbacks.
        let total_sectors_16 = read_le_u16(sector, 19)?;
        let total_sectors_32 = read_le_u32(sector, 32)?;
        let total_sectors = if total_sectors_32 != 0 {
            total_sectors_32
        } else {
            u32::from(total_sectors_16)
        };

        let sectors_per_fat_16 = read_le_u16(sector, 22)?;
        let sectors_per_fat_32 = read_le_u32(sector, 36)?;
        let is_fat32 = sectors_per_fat_16 == 0;
        let sectors_per_fat = if is_fat32 {
            sectors_per_fat_32
        } else {
            u32::from(sectors_per_fat_16)
        };
        if sectors_per_fat == 0 {
            return Err(ParseError::InvalidField {
                field: "sectors_per_fat",
                reason: "must be nonzero",
            });
        }

        let (root_dir_first_cluster, fsinfo_sector, backup_boot_sector, label, fs_type) =
            if is_fat32 {
                (
                    read_le_u32(sector, 44)?,
                    read_le_u16(sector, 48)?,
                    read_le_u16(sector, 50)?,
                    trim_space_padded(ensure_slice(sector, 71, 11)?),
                    trim_space_padded(ensure_slice(sector, 82, 8)?),
                )
            } else {
                (
                    0,
                    0,
                    0,
                    trim_space_padded(ensure_slice(sector, 43, 11)?),
                    trim_space_padded(ensure_slice(sector, 54, 8)?),
                )
            };

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            number_of_fats,
            total_sectors,
            sectors_per_fat,
            root_dir_first_cluster,
            fsinfo_sector,
            backup_boot_sector,
            volume_label: label,
            fs_type,
        })
    }

    /// True when the record carries FAT32 geometry.
    #[must_use]
    pub fn is_fat32(&self) -> bool {
        self.root_dir_first_cluster != 0
    }

    /// First sector of the first FAT copy.
    #[must_use]
    pub fn fat_start_sector(&self) -> u64 {
        u64::from(self.reserved_sectors)
    }

    /// First sector of the data region (after reserved sectors and FATs).
    #[must_use]
    pub fn first_data_sector(&self) -> u64 {
        u64::from(self.reserved_sectors)
            + u64::from(self.number_of_fats) * u64::from(self.sectors_per_fat)
    }

    /// Cluster size in bytes.
    #[must_use]
    pub fn cluster_size(&self) -> u32 {
        u32::from(self.bytes_per_sector) * u32::from(self.sectors_per_cluster)
    }

    /// First sector of a data cluster (clusters start at 2).
    #[must_use]
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector()
            + u64::from(cluster.saturating_sub(2)) * u64::from(self.sectors_per_cluster)
    }

    /// Number of addressable data clusters.
    #[must_use]
    pub fn cluster_count(&self) -> u32 {
        let data_sectors = u64::from(self.total_sectors).saturating_sub(self.first_data_sector());
        u32::try_from(data_sectors / u64::from(self.sectors_per_cluster)).unwrap_or(u32::MAX)
    }

    /// Highest valid cluster number.
    #[must_use]
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count().saturating_add(1)
    }

    /// Serialize a FAT32 boot sector.
    #[must_use]
    pub fn build(params: &BootSectorParams) -> [u8; SECTOR_SIZE] {
        let mut sector = [0_u8; SECTOR_SIZE];
        sector[0] = 0xEB;
        sector[1] = 0x58;
        sector[2] = 0x90;
        sector[3..11].copy_from_slice(b"MSDOS5.0");
        put_le_u16(&mut sector, 11, SECTOR_SIZE as u16);
        sector[13] = params.sectors_per_cluster;
        put_le_u16(&mut sector, 14, params.reserved_sectors);
        sector[16] = 2; // two FAT copies
        sector[21] = 0xF8; // media descriptor: fixed disk
        put_le_u16(&mut sector, 24, 63); // sectors per track (geometry is vestigial)
        put_le_u16(&mut sector, 26, 255); // heads
        put_le_u32(&mut sector, 32, params.total_sectors);
        put_le_u32(&mut sector, 36, params.sectors_per_fat);
        put_le_u32(&mut sector, 44, 2); // root directory first cluster
        put_le_u16(&mut sector, 48, 1); // FSInfo sector
        put_le_u16(&mut sector, 50, 6); // backup boot sector
        sector[66] = 0x29; // extended boot signature
        put_le_u32(&mut sector, 67, 0x1A2B_3C4D); // volume serial
        let mut label = [b' '; 11];
        for (dst, src) in label.iter_mut().zip(params.volume_label.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        sector[71..82].copy_from_slice(&label);
        sector[82..90].copy_from_slice(b"FAT32   ");
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }
}

/// Serialize an FSInfo sector with the given free-cluster hint.
#[must_use]
pub fn build_fsinfo(free_clusters: u32, next_free: u32) -> [u8; SECTOR_SIZE] {
    let mut sector = [0_u8; SECTOR_SIZE];
    sector[0..4].copy_from_slice(b"RRaA");
    sector[484..488].copy_from_slice(b"rrAa");
    put_le_u32(&mut sector, 488, free_clusters);
    put_le_u32(&mut sector, 492, next_free);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Serialize a reserved sector that carries only the trailing signature.
#[must_use]
pub fn build_signed_reserved_sector() -> [u8; SECTOR_SIZE] {
    let mut sector = [0_u8; SECTOR_SIZE];
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}
