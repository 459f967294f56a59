#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` trait for positioned raw I/O, a file-backed
//! implementation using `pread`/`pwrite` semantics, an in-memory device for
//! tests and tooling, and the `SectorDevice` that exposes plaintext sectors
//! over a byte device plus an XTS codec.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use veil_error::{Result, VeilError};
use veil_types::ByteOffset;

mod sector;

pub use sector::SectorDevice;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Implementations own no cryptographic state; they move raw bytes.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len_u64 =
        u64::try_from(len).map_err(|_| VeilError::InvalidArgument("I/O length".to_owned()))?;
    let end = offset
        .0
        .checked_add(len_u64)
        .ok_or(VeilError::OutOfBounds {
            offset: offset.0,
            len: len_u64,
            device_len,
        })?;
    if end > device_len {
        return Err(VeilError::OutOfBounds {
            offset: offset.0,
            len: len_u64,
            device_len,
        });
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing container file, falling back to read-only when the
    /// file is not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create a fixed-size container file. Fails if the file exists.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VeilError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Used by unit and end-to-end tests across the workspace, and by tooling
/// that assembles container images before writing them out.
#[derive(Debug)]
pub struct MemByteDevice {
    data: parking_lot::Mutex<Vec<u8>>,
    len: u64,
}

impl MemByteDevice {
    /// Allocate a zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: u64) -> Self {
        let size = usize::try_from(len).unwrap_or(usize::MAX);
        Self {
            data: parking_lot::Mutex::new(vec![0_u8; size]),
            len,
        }
    }

    /// Wrap an existing image.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            data: parking_lot::Mutex::new(data),
            len,
        }
    }

    /// Snapshot the current contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let data = self.data.lock();
        let start = offset.0 as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let mut data = self.data.lock();
        let start = offset.0 as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
