#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one cached disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Size of one physical page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Block number within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Cache key: one disk block on one device.
///
/// Unique among valid buffers while any reference is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub dev: DeviceId,
    pub block: BlockNumber,
}

impl BlockKey {
    #[must_use]
    pub fn new(dev: DeviceId, block: BlockNumber) -> Self {
        Self { dev, block }
    }

    /// Map this key to a cache shard.
    ///
    /// `dev * block + dev + block` spreads adjacent block numbers of the same
    /// device across shards, so likely-concurrent requests rarely collide.
    #[must_use]
    pub fn shard_index(self, shard_count: usize) -> usize {
        let dev = u64::from(self.dev.0);
        let block = self.block.0;
        let mixed = dev
            .wrapping_mul(block)
            .wrapping_add(dev)
            .wrapping_add(block);
        let shard_count_u64 = u64::try_from(shard_count).expect("shard count must fit in u64");
        usize::try_from(mixed % shard_count_u64).expect("remainder must fit in usize")
    }
}

/// Identifier of an execution core.
///
/// The allocator keeps one free list per core; callers pass the id of the
/// core they are running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub usize);

/// Address of a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Whether this address sits on a page boundary.
    #[must_use]
    pub fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry: {field} ({reason})")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Managed physical range `[start, end)`, both bounds page-aligned.
///
/// Pages outside this range are never touched by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysRange {
    start: PageAddr,
    end: PageAddr,
}

impl PhysRange {
    /// Create a range if both bounds are page-aligned and `start < end`.
    pub fn new(start: PageAddr, end: PageAddr) -> Result<Self, GeometryError> {
        if !start.is_page_aligned() {
            return Err(GeometryError::Invalid {
                field: "start",
                reason: "must be page-aligned",
            });
        }
        if !end.is_page_aligned() {
            return Err(GeometryError::Invalid {
                field: "end",
                reason: "must be page-aligned",
            });
        }
        if start.0 >= end.0 {
            return Err(GeometryError::Invalid {
                field: "end",
                reason: "must be greater than start",
            });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn start(self) -> PageAddr {
        self.start
    }

    #[must_use]
    pub fn end(self) -> PageAddr {
        self.end
    }

    /// Number of whole pages in the range.
    #[must_use]
    pub fn page_count(self) -> usize {
        usize::try_from((self.end.0 - self.start.0) / PAGE_SIZE as u64)
            .expect("page count must fit in usize")
    }

    /// Whether `addr` falls inside the range.
    #[must_use]
    pub fn contains(self, addr: PageAddr) -> bool {
        addr.0 >= self.start.0 && addr.0 < self.end.0
    }
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.dev, self.block)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
