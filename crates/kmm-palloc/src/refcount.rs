//! Single free list with per-frame share counts.
//!
//! Supports pages legitimately held by several owners (copy-on-write
//! duplication): [`RefCountAllocator::share`] adds an owner, and a page
//! returns to the free list only when its final owner releases it. The
//! share counts live behind one dedicated counter lock, separate from the
//! free-list lock; neither is ever held across the other's acquisition on
//! the release path's frame fill.

use crate::{ALLOC_FILL, AllocStats, FREE_FILL, FrameArena, PageAllocator};
use kmm_error::{KmmError, Result};
use kmm_types::{CoreId, PageAddr, PhysRange};
use parking_lot::Mutex;
use tracing::{info, trace};

/// Page allocator with a global free list and per-page reference counts.
pub struct RefCountAllocator {
    arena: FrameArena,
    free: Mutex<Vec<PageAddr>>,
    /// Share count per frame, indexed like the arena. Zero means the frame
    /// is free (or was never allocated).
    counts: Mutex<Vec<u32>>,
    stats: Mutex<AllocStats>,
}

impl RefCountAllocator {
    /// Carve `range` into pages, all initially on the global free list.
    pub fn new(range: PhysRange) -> Result<Self> {
        let arena = FrameArena::new(range);
        let free: Vec<PageAddr> = (0..arena.page_count()).map(|i| arena.addr_of(i)).collect();
        let counts = vec![0_u32; arena.page_count()];
        info!(
            pages = arena.page_count(),
            "page_allocator: initializing reference-counted list"
        );
        Ok(Self {
            arena,
            free: Mutex::new(free),
            counts: Mutex::new(counts),
            stats: Mutex::new(AllocStats::default()),
        })
    }

    /// Add an owner to an allocated page.
    ///
    /// # Errors
    ///
    /// [`KmmError::FatalViolation`] if `addr` is invalid or the page is not
    /// currently allocated.
    pub fn share(&self, addr: PageAddr) -> Result<()> {
        let index = self.arena.index_of(addr)?;
        let mut counts = self.counts.lock();
        if counts[index] == 0 {
            return Err(KmmError::fatal(format!("share of free page {addr}")));
        }
        counts[index] += 1;
        trace!(addr = %addr, count = counts[index], "palloc_share");
        Ok(())
    }

    /// Current owner count of a page.
    pub fn ref_count(&self, addr: PageAddr) -> Result<u32> {
        let index = self.arena.index_of(addr)?;
        Ok(self.counts.lock()[index])
    }
}

impl std::fmt::Debug for RefCountAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCountAllocator")
            .field("arena", &self.arena)
            .field("free", &self.free.lock().len())
            .finish_non_exhaustive()
    }
}

impl PageAllocator for RefCountAllocator {
    fn allocate(&self, _core: CoreId) -> Result<PageAddr> {
        let Some(addr) = self.free.lock().pop() else {
            return Err(KmmError::OutOfMemory);
        };
        let index = self
            .arena
            .index_of(addr)
            .expect("free list holds only arena addresses");
        self.counts.lock()[index] = 1;
        self.arena.fill(addr, ALLOC_FILL)?;
        self.stats.lock().allocations += 1;
        trace!(addr = %addr, "palloc_allocate");
        Ok(addr)
    }

    fn release(&self, _core: CoreId, addr: PageAddr) -> Result<()> {
        let index = self.arena.index_of(addr)?;

        let now_free = {
            let mut counts = self.counts.lock();
            if counts[index] == 0 {
                return Err(KmmError::fatal(format!("release of free page {addr}")));
            }
            counts[index] -= 1;
            counts[index] == 0
        };

        if now_free {
            self.arena.fill(addr, FREE_FILL)?;
            self.free.lock().push(addr);
        }
        self.stats.lock().releases += 1;
        trace!(addr = %addr, now_free, "palloc_release");
        Ok(())
    }

    fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    fn arena(&self) -> &FrameArena {
        &self.arena
    }

    fn stats(&self) -> AllocStats {
        self.stats.lock().clone()
    }
}
