#![forbid(unsafe_code)]
//! Sharded disk-block cache.
//!
//! Provides the [`BlockDevice`] trait (the raw, blocking disk primitive),
//! two implementations ([`RamDisk`] for tests and benchmarks,
//! [`FileBlockDevice`] for image files), and the [`BufferCache`] itself:
//! a fixed pool of block buffers partitioned into independently locked
//! shards with least-recently-used eviction and blocking per-buffer locks.

mod cache;

pub use cache::{BufferCache, BufferGuard, CacheConfig, CacheStats, PinnedBuffer};

use kmm_error::{KmmError, Result};
use kmm_types::{BLOCK_SIZE, BlockNumber, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

fn check_block_len(len: usize) -> Result<()> {
    if len == BLOCK_SIZE {
        Ok(())
    } else {
        Err(KmmError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("block payload must be {BLOCK_SIZE} bytes, got {len}"),
        )))
    }
}

/// Raw block-device primitive.
///
/// Both operations block until the transfer completes and are assumed
/// reliable by the cache; host-level failures surface as [`KmmError::Io`].
/// Payload slices are always exactly [`BLOCK_SIZE`] bytes.
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`.
    fn read_block(&self, dev: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write one block from `data`.
    fn write_block(&self, dev: DeviceId, block: BlockNumber, data: &[u8]) -> Result<()>;
}

/// In-memory block device.
///
/// Serves every [`DeviceId`] with `block_count` zero-initialized blocks,
/// materialized on first touch. All latency-free, for tests and benchmarks.
pub struct RamDisk {
    block_count: u64,
    devices: Mutex<HashMap<DeviceId, Vec<u8>>>,
}

impl RamDisk {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blocks each device serves.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn offset_of(&self, block: BlockNumber) -> Result<usize> {
        if block.0 >= self.block_count {
            return Err(KmmError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            )));
        }
        usize::try_from(block.0 * BLOCK_SIZE as u64).map_err(|_| {
            KmmError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "block offset does not fit usize",
            ))
        })
    }

    fn backing_len(&self) -> usize {
        usize::try_from(self.block_count)
            .unwrap_or(usize::MAX)
            .saturating_mul(BLOCK_SIZE)
    }
}

impl std::fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamDisk")
            .field("block_count", &self.block_count)
            .field("devices", &self.devices.lock().len())
            .finish()
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, dev: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        check_block_len(buf.len())?;
        let offset = self.offset_of(block)?;
        let mut devices = self.devices.lock();
        let backing_len = self.backing_len();
        let bytes = devices.entry(dev).or_insert_with(|| vec![0_u8; backing_len]);
        buf.copy_from_slice(&bytes[offset..offset + BLOCK_SIZE]);
        drop(devices);
        Ok(())
    }

    fn write_block(&self, dev: DeviceId, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_block_len(data.len())?;
        let offset = self.offset_of(block)?;
        let mut devices = self.devices.lock();
        let backing_len = self.backing_len();
        let bytes = devices.entry(dev).or_insert_with(|| vec![0_u8; backing_len]);
        bytes[offset..offset + BLOCK_SIZE].copy_from_slice(data);
        drop(devices);
        Ok(())
    }
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// Serves exactly one [`DeviceId`]. Uses `std::os::unix::fs::FileExt`, which
/// is thread-safe and does not require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    dev: DeviceId,
    block_count: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an image file, read-write if possible, read-only otherwise.
    ///
    /// The file length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>, dev: DeviceId) -> Result<Self> {
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
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(KmmError::InvalidGeometry(format!(
                "image length is not block-aligned: len={len} block_size={BLOCK_SIZE}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            dev,
            block_count: len / BLOCK_SIZE as u64,
            writable,
        })
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn check_access(&self, dev: DeviceId, block: BlockNumber) -> Result<u64> {
        if dev != self.dev {
            return Err(KmmError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown device: {dev} (serving {})", self.dev),
            )));
        }
        if block.0 >= self.block_count {
            return Err(KmmError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            )));
        }
        Ok(block.0 * BLOCK_SIZE as u64)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, dev: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        check_block_len(buf.len())?;
        let offset = self.check_access(dev, block)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, dev: DeviceId, block: BlockNumber, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        check_block_len(data.len())?;
        if !self.writable {
            return Err(KmmError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        let offset = self.check_access(dev, block)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trips() {
        let disk = RamDisk::new(8);
        let dev = DeviceId(1);

        let mut buf = vec![0_u8; BLOCK_SIZE];
        disk.read_block(dev, BlockNumber(3), &mut buf).expect("read");
        assert!(buf.iter().all(|&b| b == 0));

        disk.write_block(dev, BlockNumber(3), &vec![7_u8; BLOCK_SIZE])
            .expect("write");
        disk.read_block(dev, BlockNumber(3), &mut buf).expect("read");
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn ram_disk_devices_are_independent() {
        let disk = RamDisk::new(4);

        disk.write_block(DeviceId(1), BlockNumber(0), &vec![1_u8; BLOCK_SIZE])
            .expect("write dev 1");
        let mut buf = vec![0xFF_u8; BLOCK_SIZE];
        disk.read_block(DeviceId(2), BlockNumber(0), &mut buf)
            .expect("read dev 2");
        assert!(buf.iter().all(|&b| b == 0), "device 2 must start zeroed");
    }

    #[test]
    fn ram_disk_rejects_out_of_range_block() {
        let disk = RamDisk::new(4);
        let mut buf = vec![0_u8; BLOCK_SIZE];
        let err = disk
            .read_block(DeviceId(1), BlockNumber(4), &mut buf)
            .expect_err("out of range");
        assert!(matches!(err, KmmError::Io(_)));
    }

    #[test]
    fn ram_disk_rejects_short_payload() {
        let disk = RamDisk::new(4);
        let mut buf = vec![0_u8; BLOCK_SIZE - 1];
        assert!(
            disk.read_block(DeviceId(1), BlockNumber(0), &mut buf)
                .is_err()
        );
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0_u8; BLOCK_SIZE * 4]).expect("image");

        let dev_id = DeviceId(0);
        let disk = FileBlockDevice::open(&path, dev_id).expect("open");
        assert_eq!(disk.block_count(), 4);

        disk.write_block(dev_id, BlockNumber(2), &vec![0xAB_u8; BLOCK_SIZE])
            .expect("write");
        let mut buf = vec![0_u8; BLOCK_SIZE];
        disk.read_block(dev_id, BlockNumber(2), &mut buf)
            .expect("read");
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ragged.img");
        std::fs::write(&path, vec![0_u8; BLOCK_SIZE + 1]).expect("image");

        let err = FileBlockDevice::open(&path, DeviceId(0)).expect_err("unaligned");
        assert!(matches!(err, KmmError::InvalidGeometry(_)));
    }

    #[test]
    fn file_device_rejects_foreign_device_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0_u8; BLOCK_SIZE]).expect("image");

        let disk = FileBlockDevice::open(&path, DeviceId(0)).expect("open");
        let mut buf = vec![0_u8; BLOCK_SIZE];
        assert!(
            disk.read_block(DeviceId(9), BlockNumber(0), &mut buf)
                .is_err()
        );
    }
}
