#![forbid(unsafe_code)]
//! Physical-page allocation.
//!
//! A fixed pool of 4096-byte page frames is carved out of a managed
//! physical range at construction and handed out by address. Two
//! interchangeable strategies implement the same [`PageAllocator`]
//! contract:
//!
//! 1. **[`PerCoreAllocator`]** — one free list per core; allocation pops
//!    the caller's own list and falls back to stealing from another core's
//!    list, so the common path contends only on the local lock.
//! 2. **[`RefCountAllocator`]** — a single global free list plus a
//!    per-frame share count under a dedicated counter lock, so a page held
//!    by several owners (e.g., copy-on-write duplicates) is returned to the
//!    free list only by its final release.
//!
//! Allocated pages are filled with [`ALLOC_FILL`] and freed pages with
//! [`FREE_FILL`], so reads of unallocated or stale memory surface as a
//! recognizable pattern rather than silence.

mod percore;
mod refcount;

pub use percore::PerCoreAllocator;
pub use refcount::RefCountAllocator;

use kmm_error::{KmmError, Result};
use kmm_types::{CoreId, PAGE_SIZE, PageAddr, PhysRange};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Fill byte for freshly allocated pages.
pub const ALLOC_FILL: u8 = 0x05;

/// Fill byte for freed pages, distinct from [`ALLOC_FILL`] to catch
/// dangling use.
pub const FREE_FILL: u8 = 0x01;

/// Allocator counters, cloned out behind the stats lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocStats {
    pub allocations: u64,
    pub releases: u64,
    /// Allocations served from another core's list (per-core strategy only).
    pub steals: u64,
}

/// Strategy selector for [`build_allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    PerCore,
    RefCounted,
}

/// Build an allocator over `range` for `cores` execution cores.
pub fn build_allocator(
    policy: AllocPolicy,
    range: PhysRange,
    cores: usize,
) -> Result<Box<dyn PageAllocator>> {
    match policy {
        AllocPolicy::PerCore => Ok(Box::new(PerCoreAllocator::new(range, cores)?)),
        AllocPolicy::RefCounted => Ok(Box::new(RefCountAllocator::new(range)?)),
    }
}

/// Common allocator contract shared by both strategies.
pub trait PageAllocator: Send + Sync {
    /// Allocate one page, returning its address.
    ///
    /// Never blocks on I/O; completes in time bounded by the core count.
    /// The page content is filled with [`ALLOC_FILL`].
    ///
    /// # Errors
    ///
    /// [`KmmError::OutOfMemory`] when every free list is empty.
    fn allocate(&self, core: CoreId) -> Result<PageAddr>;

    /// Return one page.
    ///
    /// # Errors
    ///
    /// [`KmmError::FatalViolation`] for a misaligned or out-of-range
    /// address — a corrupted or foreign pointer.
    fn release(&self, core: CoreId, addr: PageAddr) -> Result<()>;

    /// Total pages currently on free lists.
    fn free_pages(&self) -> usize;

    /// The frame storage backing this allocator.
    fn arena(&self) -> &FrameArena;

    /// Snapshot of the allocator counters.
    fn stats(&self) -> AllocStats;
}

/// Fixed frame storage for a managed physical range.
///
/// One [`PAGE_SIZE`]-byte frame per page in the range, addressed by
/// [`PageAddr`]. The arena validates every address it is handed; a
/// misaligned or out-of-range address is a fatal violation, never a
/// silent no-op.
pub struct FrameArena {
    range: PhysRange,
    frames: Vec<Mutex<Box<[u8]>>>,
}

impl FrameArena {
    #[must_use]
    pub fn new(range: PhysRange) -> Self {
        let frames = (0..range.page_count())
            .map(|_| Mutex::new(vec![0_u8; PAGE_SIZE].into_boxed_slice()))
            .collect();
        Self { range, frames }
    }

    /// The managed range.
    #[must_use]
    pub fn range(&self) -> PhysRange {
        self.range
    }

    /// Number of frames in the arena.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    /// Address of the frame at `index`.
    #[must_use]
    pub fn addr_of(&self, index: usize) -> PageAddr {
        let offset = u64::try_from(index).expect("frame index must fit in u64")
            * PAGE_SIZE as u64;
        PageAddr(self.range.start().0 + offset)
    }

    /// Frame index for `addr`.
    ///
    /// # Errors
    ///
    /// [`KmmError::FatalViolation`] if `addr` is not page-aligned or lies
    /// outside the managed range.
    pub fn index_of(&self, addr: PageAddr) -> Result<usize> {
        if !addr.is_page_aligned() {
            return Err(KmmError::fatal(format!("misaligned page address {addr}")));
        }
        if !self.range.contains(addr) {
            return Err(KmmError::fatal(format!(
                "page address {addr} outside managed range [{}, {})",
                self.range.start(),
                self.range.end()
            )));
        }
        usize::try_from((addr.0 - self.range.start().0) / PAGE_SIZE as u64)
            .map_err(|_| KmmError::fatal(format!("frame index overflow for {addr}")))
    }

    /// Exclusive access to the frame at `addr`.
    pub fn frame(&self, addr: PageAddr) -> Result<MutexGuard<'_, Box<[u8]>>> {
        let index = self.index_of(addr)?;
        Ok(self.frames[index].lock())
    }

    /// Fill the frame at `addr` with `byte`.
    pub(crate) fn fill(&self, addr: PageAddr, byte: u8) -> Result<()> {
        self.frame(addr)?.fill(byte);
        Ok(())
    }
}

impl std::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("range", &self.range)
            .field("pages", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(pages: u64) -> PhysRange {
        PhysRange::new(PageAddr(0x1000), PageAddr(0x1000 + pages * PAGE_SIZE as u64))
            .expect("range")
    }

    #[test]
    fn arena_addressing_round_trips() {
        let arena = FrameArena::new(range(4));
        assert_eq!(arena.page_count(), 4);
        for index in 0..4 {
            let addr = arena.addr_of(index);
            assert!(addr.is_page_aligned());
            assert_eq!(arena.index_of(addr).expect("index"), index);
        }
    }

    #[test]
    fn misaligned_address_is_fatal() {
        let arena = FrameArena::new(range(4));
        let err = arena.index_of(PageAddr(0x1001)).expect_err("misaligned");
        assert!(err.is_fatal());
    }

    #[test]
    fn out_of_range_address_is_fatal() {
        let arena = FrameArena::new(range(4));
        for addr in [PageAddr(0), PageAddr(0x1000 + 4 * PAGE_SIZE as u64)] {
            let err = arena.index_of(addr).expect_err("out of range");
            assert!(err.is_fatal(), "expected fatal for {addr}");
        }
    }

    #[test]
    fn frame_access_is_page_sized() {
        let arena = FrameArena::new(range(2));
        let addr = arena.addr_of(1);
        let mut frame = arena.frame(addr).expect("frame");
        assert_eq!(frame.len(), PAGE_SIZE);
        frame[0] = 0xEE;
        drop(frame);
        assert_eq!(arena.frame(addr).expect("frame")[0], 0xEE);
    }

    #[test]
    fn build_allocator_selects_strategy() {
        let per_core =
            build_allocator(AllocPolicy::PerCore, range(4), 2).expect("per-core");
        assert_eq!(per_core.free_pages(), 4);

        let ref_counted =
            build_allocator(AllocPolicy::RefCounted, range(4), 2).expect("ref-counted");
        assert_eq!(ref_counted.free_pages(), 4);
    }
}
