#![forbid(unsafe_code)]
//! Container lifecycle: authentication, creation, and the mounted-volume
//! API surface.
//!
//! `open_container` derives the header key from the (keyfile-mixed)
//! password, trial-decrypts the header and installs the XTS codec, sector
//! device and FAT engine. `create_container` writes a fresh header pair
//! and formats the data area. Closing a volume drops every key-holding
//! object; all of them zeroize on drop.

use parking_lot::RwLock;
use rand::RngCore;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use veil_block::{ByteDevice, SectorDevice};
use veil_crypto::{derive_header_key, iterations, mix_password, Keyfile, MasterKey, VolumeKind, XtsCodec};
use veil_error::{Result, VeilError};
use veil_fat::{FatFs, FileEntry};
use veil_ondisk::header::KEYDATA_SIZE;
use veil_ondisk::{HeaderParams, HeaderSummary, VolumeHeader};
use veil_types::{
    ByteOffset, DATA_AREA_OFFSET, HEADER_SIZE, MASTER_KEY_SIZE, SALT_SIZE, SECTOR_SIZE,
};
use zeroize::Zeroize;

mod mkfs;

/// Smallest accepted container: two header groups plus a 1 MiB data area.
pub const MIN_CONTAINER_SIZE: u64 = 2 * DATA_AREA_OFFSET + 1024 * 1024;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Create a new encrypted container on `device` and format its data area
/// as FAT32. The device's length fixes the container size.
pub fn create_container(
    device: Arc<dyn ByteDevice>,
    password: &[u8],
    pim: i32,
    keyfiles: &[Keyfile],
    label: &str,
) -> Result<()> {
    let total = device.len_bytes();
    if total < MIN_CONTAINER_SIZE || total % SECTOR_SIZE as u64 != 0 {
        return Err(VeilError::InvalidArgument(format!(
            "container must be a sector multiple of at least {MIN_CONTAINER_SIZE} bytes"
        )));
    }
    let data_area_size = total - 2 * DATA_AREA_OFFSET;

    let mut salt = [0_u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut keydata = [0_u8; KEYDATA_SIZE];
    rand::thread_rng().fill_bytes(&mut keydata);

    let now = unix_now();
    let params = HeaderParams {
        volume_creation_time: now,
        header_modification_time: now,
        data_area_size,
        encrypted_area_start: DATA_AREA_OFFSET,
        encrypted_area_length: data_area_size,
        flags: 0,
        sector_size: SECTOR_SIZE as u32,
    };
    let mut payload = VolumeHeader::build(&params, &keydata);

    let mut mixed = mix_password(password, keyfiles);
    let header_key = derive_header_key(&mixed, &salt, iterations(VolumeKind::NonSystem, pim))?;
    mixed.zeroize();
    let header_xts = XtsCodec::new(header_key.as_bytes())?;
    header_xts.encrypt_unit(0, &mut payload)?;

    let mut record = Vec::with_capacity(HEADER_SIZE);
    record.extend_from_slice(&salt);
    record.extend_from_slice(&payload);
    device.write_all_at(ByteOffset(0), &record)?;
    // Backup header at the tail of the container.
    device.write_all_at(ByteOffset(total - DATA_AREA_OFFSET), &record)?;

    let mut master_key_bytes = [0_u8; MASTER_KEY_SIZE];
    master_key_bytes.copy_from_slice(&keydata[..MASTER_KEY_SIZE]);
    let master = MasterKey::from_bytes(master_key_bytes);
    master_key_bytes.zeroize();
    keydata.zeroize();

    let xts = Arc::new(XtsCodec::from_master_key(&master)?);
    let sector_dev = SectorDevice::new(device.clone(), xts, DATA_AREA_OFFSET, data_area_size)?;
    mkfs::format_volume(&sector_dev, label)?;
    sector_dev.sync()?;

    info!(
        target: "veil::volume",
        event = "created",
        total_bytes = total,
        data_bytes = data_area_size
    );
    Ok(())
}

/// Authenticate against `device` and mount its filesystem.
///
/// Any header that fails to validate after trial decryption reports
/// [`VeilError::Auth`]; a wrong password and a damaged header are
/// indistinguishable by design.
pub fn open_container(
    device: Arc<dyn ByteDevice>,
    password: &[u8],
    pim: i32,
    keyfiles: &[Keyfile],
) -> Result<MountedVolume> {
    if device.len_bytes() < MIN_CONTAINER_SIZE {
        return Err(VeilError::Corrupt("container too small".to_owned()));
    }

    let mut record = [0_u8; HEADER_SIZE];
    device.read_exact_at(ByteOffset(0), &mut record)?;
    let mut salt = [0_u8; SALT_SIZE];
    salt.copy_from_slice(&record[..SALT_SIZE]);

    let mut mixed = mix_password(password, keyfiles);
    let header_key = derive_header_key(&mixed, &salt, iterations(VolumeKind::NonSystem, pim))?;
    mixed.zeroize();

    let header_xts = XtsCodec::new(header_key.as_bytes())?;
    let mut payload = record[SALT_SIZE..].to_vec();
    header_xts.decrypt_unit(0, &mut payload)?;

    // The decrypted payload carries key material whenever the password was
    // right, even if validation fails further on; wipe it on every path.
    let parsed = VolumeHeader::parse(&payload);
    payload.zeroize();
    let header = match parsed {
        Ok(header) => header,
        Err(_) => return Err(VeilError::Auth),
    };

    if header.sector_size != SECTOR_SIZE as u32 {
        return Err(VeilError::Corrupt(format!(
            "unsupported sector size {}",
            header.sector_size
        )));
    }
    if header.encrypted_area_start % SECTOR_SIZE as u64 != 0
        || header.encrypted_area_length % SECTOR_SIZE as u64 != 0
    {
        return Err(VeilError::Corrupt(
            "data area is not sector aligned".to_owned(),
        ));
    }

    let master = MasterKey::from_bytes(header.master_key_bytes());
    let xts = Arc::new(XtsCodec::from_master_key(&master)?);
    let sector_dev = Arc::new(SectorDevice::new(
        device,
        xts,
        header.encrypted_area_start,
        header.encrypted_area_length,
    )?);
    let fat = FatFs::mount(Arc::clone(&sector_dev))?;

    debug!(
        target: "veil::volume",
        event = "mounted",
        data_bytes = header.encrypted_area_length
    );
    Ok(MountedVolume {
        state: RwLock::new(MountState::Mounted(Arc::new(VolumeInner {
            fat,
            summary: header.summary(),
            _master: master,
        }))),
    })
}

enum MountState {
    Mounted(Arc<VolumeInner>),
    Unmounted,
}

struct VolumeInner {
    fat: FatFs,
    summary: HeaderSummary,
    /// Held so the master key's lifetime matches the mount; zeroized on
    /// drop together with the codec's round keys.
    _master: MasterKey,
}

/// A mounted volume.
///
/// Lifecycle: `Unmounted → Mounting → Mounted → Unmounting → Unmounted`,
/// where the transitional states are internal to [`open_container`] and
/// [`MountedVolume::close`]. Operations on a closed volume report
/// `InvalidArgument`. Closing drops every key-holding object; in-flight
/// operations finish first, after which zeroization runs.
pub struct MountedVolume {
    state: RwLock<MountState>,
}

impl std::fmt::Debug for MountedVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedVolume").finish_non_exhaustive()
    }
}

impl MountedVolume {
    fn inner(&self) -> Result<Arc<VolumeInner>> {
        match &*self.state.read() {
            MountState::Mounted(inner) => Ok(Arc::clone(inner)),
            MountState::Unmounted => Err(VeilError::InvalidArgument(
                "volume is not mounted".to_owned(),
            )),
        }
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        matches!(&*self.state.read(), MountState::Mounted(_))
    }

    /// Header fields of the mounted volume (no key material).
    pub fn header(&self) -> Result<HeaderSummary> {
        Ok(self.inner()?.summary.clone())
    }

    /// Parsed boot-sector geometry.
    pub fn boot_sector(&self) -> Result<veil_ondisk::BootSector> {
        Ok(self.inner()?.fat.boot_sector().clone())
    }

    /// List a directory.
    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.inner()?.fat.list(path)
    }

    /// Entry metadata for a path.
    pub fn stat(&self, path: &str) -> Result<FileEntry> {
        self.inner()?.fat.stat(path)
    }

    /// Whether a path exists.
    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.inner()?.fat.exists(path))
    }

    /// Read a whole file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner()?.fat.read(path)
    }

    /// Read a byte range of a file.
    pub fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.inner()?.fat.read_range(path, offset, length)
    }

    /// Stream a file into `sink`; a sink that closes early ends the
    /// stream without error. Returns the bytes delivered.
    pub fn stream(&self, path: &str, sink: &mut dyn Write) -> Result<u64> {
        self.inner()?.fat.stream(path, sink)
    }

    /// Replace a file's content.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.inner()?.fat.write(path, data)
    }

    /// Stream `size` bytes from `source` into a file. `progress` receives
    /// cumulative byte counts.
    pub fn write_streaming(
        &self,
        path: &str,
        source: &mut dyn Read,
        size: u64,
        progress: impl FnMut(u64),
    ) -> Result<()> {
        self.inner()?.fat.write_streaming(path, source, size, progress)
    }

    /// Create an empty file.
    pub fn create_file(&self, parent: &str, name: &str) -> Result<FileEntry> {
        self.inner()?.fat.create_file(parent, name)
    }

    /// Create a directory.
    pub fn create_directory(&self, parent: &str, name: &str) -> Result<FileEntry> {
        self.inner()?.fat.create_directory(parent, name)
    }

    /// Delete a file or directory tree.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.inner()?.fat.delete(path)
    }

    /// Free space in bytes.
    pub fn free_space(&self) -> Result<u64> {
        self.inner()?.fat.free_space()
    }

    /// Total data capacity in bytes.
    pub fn total_space(&self) -> Result<u64> {
        Ok(self.inner()?.fat.total_space())
    }

    /// Unmount. Idempotent; operations after this fail.
    pub fn close(&self) {
        let mut state = self.state.write();
        if matches!(&*state, MountState::Mounted(_)) {
            debug!(target: "veil::volume", event = "unmounted");
        }
        *state = MountState::Unmounted;
    }
}

impl Drop for MountedVolume {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_block::MemByteDevice;

    const TEST_SIZE: u64 = 4 * 1024 * 1024;

    // PIM 1 keeps the KDF cheap in tests (16k iterations instead of 500k).
    fn new_container(password: &[u8]) -> Arc<MemByteDevice> {
        let device = Arc::new(MemByteDevice::new(TEST_SIZE));
        create_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            password,
            1,
            &[],
            "veil",
        )
        .unwrap();
        device
    }

    #[test]
    fn create_rejects_undersized_devices() {
        let device = Arc::new(MemByteDevice::new(1024 * 1024));
        let err = create_container(device, b"pw", 0, &[], "x").unwrap_err();
        assert!(matches!(err, VeilError::InvalidArgument(_)));
    }

    #[test]
    fn open_with_wrong_password_is_auth_failure() {
        // Low PIM keeps the KDF fast in tests.
        let device = Arc::new(MemByteDevice::new(TEST_SIZE));
        create_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            b"correct",
            1,
            &[],
            "veil",
        )
        .unwrap();

        let err =
            open_container(Arc::clone(&device) as Arc<dyn ByteDevice>, b"wrong", 1, &[])
                .unwrap_err();
        assert!(matches!(err, VeilError::Auth));

        let vol =
            open_container(Arc::clone(&device) as Arc<dyn ByteDevice>, b"correct", 1, &[])
                .unwrap();
        assert!(vol.is_mounted());
    }

    #[test]
    fn wrong_pim_fails_like_wrong_password() {
        let device = Arc::new(MemByteDevice::new(TEST_SIZE));
        create_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            b"pw",
            1,
            &[],
            "veil",
        )
        .unwrap();
        let err =
            open_container(Arc::clone(&device) as Arc<dyn ByteDevice>, b"pw", 2, &[]).unwrap_err();
        assert!(matches!(err, VeilError::Auth));
    }

    #[test]
    fn header_geometry_matches_creation() {
        let device = Arc::new(MemByteDevice::new(TEST_SIZE));
        create_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            b"pw",
            1,
            &[],
            "veil",
        )
        .unwrap();
        let vol =
            open_container(Arc::clone(&device) as Arc<dyn ByteDevice>, b"pw", 1, &[]).unwrap();
        let header = vol.header().unwrap();
        assert_eq!(header.encrypted_area_start, DATA_AREA_OFFSET);
        assert_eq!(header.encrypted_area_length, TEST_SIZE - 2 * DATA_AREA_OFFSET);
        assert_eq!(header.sector_size, 512);
    }

    #[test]
    fn backup_header_is_written_at_the_tail() {
        let device = new_container(b"pw");
        let image = device.to_vec();
        let primary = &image[..HEADER_SIZE];
        let backup_offset = (TEST_SIZE - DATA_AREA_OFFSET) as usize;
        let backup = &image[backup_offset..backup_offset + HEADER_SIZE];
        assert_eq!(primary, backup);
        // And it is not plaintext: no magic bytes visible.
        assert!(!primary.windows(4).any(|w| w == b"VERA"));
    }

    #[test]
    fn closed_volume_rejects_operations() {
        let device = new_container(b"pw");
        let vol = open_container(device, b"pw", 1, &[]).unwrap();
        vol.close();
        assert!(!vol.is_mounted());
        assert!(matches!(
            vol.list("/"),
            Err(VeilError::InvalidArgument(_))
        ));
        // close is idempotent
        vol.close();
    }

    #[test]
    fn keyfiles_change_the_derived_key() {
        let device = Arc::new(MemByteDevice::new(TEST_SIZE));
        let keyfile = Keyfile::from_bytes(b"keyfile_content_123".to_vec());
        create_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            b"",
            1,
            std::slice::from_ref(&keyfile),
            "veil",
        )
        .unwrap();

        // Without the keyfile the same password fails.
        let err =
            open_container(Arc::clone(&device) as Arc<dyn ByteDevice>, b"", 1, &[]).unwrap_err();
        assert!(matches!(err, VeilError::Auth));

        let vol = open_container(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            b"",
            1,
            std::slice::from_ref(&keyfile),
        )
        .unwrap();
        assert!(vol.is_mounted());
    }
}
