//! Plaintext sector access over an encrypted byte device.
//!
//! The device-level I/O lock is held only for the positioned read or write;
//! all XTS work happens outside it. Batches of 16 sectors or more fan out
//! over scoped worker threads, at most eight, each processing a contiguous
//! run of whole sectors.

use crate::ByteDevice;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::trace;
use veil_crypto::XtsCodec;
use veil_error::{Result, VeilError};
use veil_types::{ByteOffset, SECTOR_SIZE};

/// Batches below this many sectors are ciphered on the calling thread.
const PARALLEL_MIN_SECTORS: usize = 16;
/// Upper bound on cipher workers regardless of core count.
const MAX_WORKERS: usize = 8;

fn worker_count(sector_count: usize) -> usize {
    let cpus = thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
    cpus.clamp(2, MAX_WORKERS).min(sector_count)
}

/// Sector-addressed view of the data area: reads decrypt, writes encrypt.
pub struct SectorDevice {
    device: Arc<dyn ByteDevice>,
    xts: Arc<XtsCodec>,
    data_area_offset: u64,
    data_area_size: u64,
    io_lock: Mutex<()>,
}

impl SectorDevice {
    /// Wrap `device` with sector-granular XTS translation for the data area
    /// at `[data_area_offset, data_area_offset + data_area_size)`.
    pub fn new(
        device: Arc<dyn ByteDevice>,
        xts: Arc<XtsCodec>,
        data_area_offset: u64,
        data_area_size: u64,
    ) -> Result<Self> {
        let sector = SECTOR_SIZE as u64;
        if data_area_offset % sector != 0 || data_area_size % sector != 0 {
            return Err(VeilError::InvalidArgument(format!(
                "data area not sector aligned: offset={data_area_offset} size={data_area_size}"
            )));
        }
        let end = data_area_offset
            .checked_add(data_area_size)
            .ok_or_else(|| VeilError::InvalidArgument("data area overflows u64".to_owned()))?;
        if end > device.len_bytes() {
            return Err(VeilError::OutOfBounds {
                offset: data_area_offset,
                len: data_area_size,
                device_len: device.len_bytes(),
            });
        }
        Ok(Self {
            device,
            xts,
            data_area_offset,
            data_area_size,
            io_lock: Mutex::new(()),
        })
    }

    /// Number of sectors in the data area.
    #[must_use]
    pub fn sector_count(&self) -> u64 {
        self.data_area_size / SECTOR_SIZE as u64
    }

    #[must_use]
    pub fn data_area_size(&self) -> u64 {
        self.data_area_size
    }

    #[must_use]
    pub fn data_area_offset(&self) -> u64 {
        self.data_area_offset
    }

    /// XTS tweak number of data-area sector 0 (absolute indexing from the
    /// start of the container).
    fn tweak_base(&self) -> u64 {
        self.data_area_offset / SECTOR_SIZE as u64
    }

    fn check_span(&self, start: u64, byte_len: u64) -> Result<u64> {
        let offset = start
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|o| o.checked_add(self.data_area_offset))
            .ok_or(VeilError::OutOfBounds {
                offset: u64::MAX,
                len: byte_len,
                device_len: self.device.len_bytes(),
            })?;
        let span_end = start
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|o| o.checked_add(byte_len))
            .ok_or(VeilError::OutOfBounds {
                offset,
                len: byte_len,
                device_len: self.device.len_bytes(),
            })?;
        if span_end > self.data_area_size {
            return Err(VeilError::OutOfBounds {
                offset,
                len: byte_len,
                device_len: self.device.len_bytes(),
            });
        }
        Ok(offset)
    }

    /// Read one sector.
    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>> {
        self.read_sectors(sector, 1)
    }

    /// Read `count` consecutive sectors: one positioned read under the I/O
    /// lock, then a batched decrypt outside it.
    pub fn read_sectors(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(VeilError::InvalidArgument(
                "sector read of zero length".to_owned(),
            ));
        }
        let byte_len = count
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or_else(|| VeilError::InvalidArgument("sector count overflows".to_owned()))?;
        let offset = self.check_span(start, byte_len)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(byte_len)
                .map_err(|_| VeilError::InvalidArgument("read too large".to_owned()))?
        ];

        {
            let _guard = self.io_lock.lock();
            self.device.read_exact_at(ByteOffset(offset), &mut buf)?;
        }

        trace!(
            target: "veil::block::io",
            event = "read_sectors",
            start = start,
            count = count
        );
        self.run_codec(self.tweak_base() + start, &mut buf, false)?;
        Ok(buf)
    }

    /// Write one sector.
    pub fn write_sector(&self, sector: u64, data: &[u8]) -> Result<()> {
        self.write_sectors(sector, data)
    }

    /// Write consecutive sectors starting at `start`: batched encrypt into a
    /// scratch buffer, then one positioned write under the I/O lock.
    pub fn write_sectors(&self, start: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() % SECTOR_SIZE != 0 {
            return Err(VeilError::InvalidArgument(format!(
                "write length must be a nonzero multiple of {SECTOR_SIZE}, got {}",
                data.len()
            )));
        }
        let offset = self.check_span(start, data.len() as u64)?;

        let mut ciphertext = data.to_vec();
        self.run_codec(self.tweak_base() + start, &mut ciphertext, true)?;

        trace!(
            target: "veil::block::io",
            event = "write_sectors",
            start = start,
            count = data.len() / SECTOR_SIZE
        );
        let _guard = self.io_lock.lock();
        self.device.write_all_at(ByteOffset(offset), &ciphertext)?;
        Ok(())
    }

    /// Flush the underlying device.
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    fn run_codec(&self, first_tweak: u64, data: &mut [u8], encrypt: bool) -> Result<()> {
        let sectors = data.len() / SECTOR_SIZE;
        if sectors < PARALLEL_MIN_SECTORS {
            return if encrypt {
                self.xts.encrypt_sectors(first_tweak, data)
            } else {
                self.xts.decrypt_sectors(first_tweak, data)
            };
        }

        let workers = worker_count(sectors);
        let per_worker = sectors.div_ceil(workers);
        let chunk_bytes = per_worker * SECTOR_SIZE;
        let xts = &self.xts;

        trace!(
            target: "veil::block::io",
            event = "codec_fanout",
            sectors = sectors,
            workers = workers
        );

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for (i, chunk) in data.chunks_mut(chunk_bytes).enumerate() {
                let chunk_tweak = first_tweak + (i * per_worker) as u64;
                handles.push(scope.spawn(move || {
                    if encrypt {
                        xts.encrypt_sectors(chunk_tweak, chunk)
                    } else {
                        xts.decrypt_sectors(chunk_tweak, chunk)
                    }
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| VeilError::Corrupt("cipher worker panicked".to_owned()))??;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemByteDevice;
    use veil_types::DATA_AREA_OFFSET;

    fn test_device(data_sectors: u64) -> SectorDevice {
        let total = DATA_AREA_OFFSET + data_sectors * SECTOR_SIZE as u64 + DATA_AREA_OFFSET;
        let device = Arc::new(MemByteDevice::new(total));
        let xts = Arc::new(XtsCodec::new(&[0x3C_u8; 64]).unwrap());
        SectorDevice::new(
            device,
            xts,
            DATA_AREA_OFFSET,
            data_sectors * SECTOR_SIZE as u64,
        )
        .unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dev = test_device(64);
        let payload: Vec<u8> = (0..SECTOR_SIZE * 4).map(|i| (i % 256) as u8).collect();
        dev.write_sectors(3, &payload).unwrap();
        assert_eq!(dev.read_sectors(3, 4).unwrap(), payload);
    }

    #[test]
    fn ciphertext_lands_on_device_not_plaintext() {
        let total = DATA_AREA_OFFSET + 8 * SECTOR_SIZE as u64;
        let device = Arc::new(MemByteDevice::new(total));
        let xts = Arc::new(XtsCodec::new(&[0x3C_u8; 64]).unwrap());
        let dev = SectorDevice::new(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            xts,
            DATA_AREA_OFFSET,
            8 * SECTOR_SIZE as u64,
        )
        .unwrap();

        let payload = vec![0x55_u8; SECTOR_SIZE];
        dev.write_sector(0, &payload).unwrap();

        let image = device.to_vec();
        let on_disk = &image[DATA_AREA_OFFSET as usize..DATA_AREA_OFFSET as usize + SECTOR_SIZE];
        assert_ne!(on_disk, payload.as_slice());
        assert_eq!(dev.read_sector(0).unwrap(), payload);
    }

    #[test]
    fn parallel_batch_matches_scalar_batch() {
        let dev = test_device(256);
        // 64 sectors crosses the fan-out threshold.
        let payload: Vec<u8> = (0..SECTOR_SIZE * 64).map(|i| (i % 253) as u8).collect();
        dev.write_sectors(10, &payload).unwrap();

        // Read back one sector at a time (scalar path) and compare.
        let mut scalar = Vec::new();
        for i in 0..64 {
            scalar.extend_from_slice(&dev.read_sector(10 + i).unwrap());
        }
        assert_eq!(scalar, payload);
        assert_eq!(dev.read_sectors(10, 64).unwrap(), payload);
    }

    #[test]
    fn bounds_are_enforced() {
        let dev = test_device(16);
        assert!(matches!(
            dev.read_sectors(15, 2),
            Err(VeilError::OutOfBounds { .. })
        ));
        assert!(matches!(
            dev.write_sectors(16, &[0_u8; SECTOR_SIZE]),
            Err(VeilError::OutOfBounds { .. })
        ));
        assert!(dev.read_sectors(0, 16).is_ok());
    }

    #[test]
    fn unaligned_write_is_invalid() {
        let dev = test_device(16);
        assert!(matches!(
            dev.write_sectors(0, &[0_u8; 100]),
            Err(VeilError::InvalidArgument(_))
        ));
    }

    #[test]
    fn tweaks_are_absolute_sector_numbers() {
        // Sector 0 of the data area must decrypt with tweak
        // DATA_AREA_OFFSET / 512, not 0.
        let total = DATA_AREA_OFFSET + 4 * SECTOR_SIZE as u64;
        let device = Arc::new(MemByteDevice::new(total));
        let key = [0x77_u8; 64];
        let xts = Arc::new(XtsCodec::new(&key).unwrap());
        let dev = SectorDevice::new(
            Arc::clone(&device) as Arc<dyn ByteDevice>,
            xts,
            DATA_AREA_OFFSET,
            4 * SECTOR_SIZE as u64,
        )
        .unwrap();

        let payload = vec![0xEE_u8; SECTOR_SIZE];
        dev.write_sector(0, &payload).unwrap();

        let image = device.to_vec();
        let mut on_disk =
            image[DATA_AREA_OFFSET as usize..DATA_AREA_OFFSET as usize + SECTOR_SIZE].to_vec();
        let codec = XtsCodec::new(&key).unwrap();
        codec
            .decrypt_sectors(DATA_AREA_OFFSET / SECTOR_SIZE as u64, &mut on_disk)
            .unwrap();
        assert_eq!(on_disk, payload);
    }
}
