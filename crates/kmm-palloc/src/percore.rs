//! Per-core free lists with cross-core stealing.
//!
//! Each core owns one lock and one LIFO free list. The fast path —
//! allocate and release on the same core — touches only that core's lock.
//! When a core's list is empty, allocation probes the other cores' lists
//! one at a time and steals the first available page. The caller's own
//! list lock is dropped before any foreign lock is taken, and at most one
//! foreign lock is held at a time, so two cores stealing from each other
//! cannot deadlock.

use crate::{ALLOC_FILL, AllocStats, FREE_FILL, FrameArena, PageAllocator};
use kmm_error::{KmmError, Result};
use kmm_types::{CoreId, PageAddr, PhysRange};
use parking_lot::Mutex;
use tracing::{info, trace};

/// Page allocator with one free list per core.
pub struct PerCoreAllocator {
    arena: FrameArena,
    lists: Vec<Mutex<Vec<PageAddr>>>,
    stats: Mutex<AllocStats>,
}

impl PerCoreAllocator {
    /// Carve `range` into pages distributed round-robin across `cores`
    /// free lists (frame number modulo core count, so initial load is
    /// balanced for any core count).
    pub fn new(range: PhysRange, cores: usize) -> Result<Self> {
        if cores == 0 {
            return Err(KmmError::InvalidGeometry("cores must be > 0".to_owned()));
        }
        let arena = FrameArena::new(range);
        let mut lists: Vec<Vec<PageAddr>> = vec![Vec::new(); cores];
        for index in 0..arena.page_count() {
            lists[index % cores].push(arena.addr_of(index));
        }
        info!(
            cores,
            pages = arena.page_count(),
            "page_allocator: initializing per-core lists"
        );
        Ok(Self {
            arena,
            lists: lists.into_iter().map(Mutex::new).collect(),
            stats: Mutex::new(AllocStats::default()),
        })
    }

    /// Number of cores (and free lists).
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.lists.len()
    }

    /// Pages currently free on `core`'s own list.
    pub fn free_pages_on(&self, core: CoreId) -> Result<usize> {
        Ok(self.list(core)?.lock().len())
    }

    fn list(&self, core: CoreId) -> Result<&Mutex<Vec<PageAddr>>> {
        self.lists
            .get(core.0)
            .ok_or_else(|| KmmError::fatal(format!("foreign core id {core}")))
    }
}

impl std::fmt::Debug for PerCoreAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerCoreAllocator")
            .field("cores", &self.lists.len())
            .field("arena", &self.arena)
            .finish_non_exhaustive()
    }
}

impl PageAllocator for PerCoreAllocator {
    fn allocate(&self, core: CoreId) -> Result<PageAddr> {
        let own = self.list(core)?;
        let mut found = own.lock().pop();

        if found.is_none() {
            // Own list empty: probe the other cores, one lock at a time.
            for (other, list) in self.lists.iter().enumerate() {
                if other == core.0 {
                    continue;
                }
                if let Some(addr) = list.lock().pop() {
                    self.stats.lock().steals += 1;
                    trace!(core = core.0, victim = other, addr = %addr, "palloc_steal");
                    found = Some(addr);
                    break;
                }
            }
        }

        let Some(addr) = found else {
            return Err(KmmError::OutOfMemory);
        };
        self.arena.fill(addr, ALLOC_FILL)?;
        self.stats.lock().allocations += 1;
        trace!(core = core.0, addr = %addr, "palloc_allocate");
        Ok(addr)
    }

    fn release(&self, core: CoreId, addr: PageAddr) -> Result<()> {
        // Validates alignment and range; a bad address is fatal.
        self.arena.index_of(addr)?;
        self.arena.fill(addr, FREE_FILL)?;
        // Always back onto the releasing core's own list.
        self.list(core)?.lock().push(addr);
        self.stats.lock().releases += 1;
        trace!(core = core.0, addr = %addr, "palloc_release");
        Ok(())
    }

    fn free_pages(&self) -> usize {
        self.lists.iter().map(|list| list.lock().len()).sum()
    }

    fn arena(&self) -> &FrameArena {
        &self.arena
    }

    fn stats(&self) -> AllocStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmm_types::PAGE_SIZE;

    fn make(pages: u64, cores: usize) -> PerCoreAllocator {
        let range = PhysRange::new(
            PageAddr(0x8000_0000),
            PageAddr(0x8000_0000 + pages * PAGE_SIZE as u64),
        )
        .expect("range");
        PerCoreAllocator::new(range, cores).expect("allocator")
    }

    #[test]
    fn rejects_zero_cores() {
        let range = PhysRange::new(PageAddr(0), PageAddr(PAGE_SIZE as u64)).expect("range");
        assert!(PerCoreAllocator::new(range, 0).is_err());
    }

    #[test]
    fn initial_distribution_is_balanced() {
        let alloc = make(8, 2);
        assert_eq!(alloc.free_pages_on(CoreId(0)).expect("core 0"), 4);
        assert_eq!(alloc.free_pages_on(CoreId(1)).expect("core 1"), 4);

        let odd = make(7, 3);
        let sizes: Vec<usize> = (0..3)
            .map(|c| odd.free_pages_on(CoreId(c)).expect("list"))
            .collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|&s| s == 2 || s == 3));
    }

    #[test]
    fn allocate_release_round_trip_restores_state() {
        let alloc = make(4, 2);
        let core = CoreId(0);
        let before = alloc.free_pages_on(core).expect("before");

        let addr = alloc.allocate(core).expect("allocate");
        assert_eq!(alloc.free_pages_on(core).expect("during"), before - 1);

        alloc.release(core, addr).expect("release");
        assert_eq!(alloc.free_pages_on(core).expect("after"), before);

        // LIFO reuse: the same address comes back on the next allocation.
        assert_eq!(alloc.allocate(core).expect("reallocate"), addr);
        alloc.release(core, addr).expect("cleanup");
    }

    #[test]
    fn allocated_page_is_pattern_filled() {
        let alloc = make(2, 1);
        let addr = alloc.allocate(CoreId(0)).expect("allocate");
        assert!(
            alloc
                .arena()
                .frame(addr)
                .expect("frame")
                .iter()
                .all(|&b| b == ALLOC_FILL)
        );

        alloc.release(CoreId(0), addr).expect("release");
        assert!(
            alloc
                .arena()
                .frame(addr)
                .expect("frame")
                .iter()
                .all(|&b| b == FREE_FILL)
        );
    }

    #[test]
    fn steals_when_own_list_is_empty() {
        // 2 cores x 2 pages each; core A's third allocation must come from
        // core B's list, shrinking it by exactly one.
        let alloc = make(4, 2);
        let a = CoreId(0);
        let b = CoreId(1);
        assert_eq!(alloc.free_pages_on(a).expect("a"), 2);
        assert_eq!(alloc.free_pages_on(b).expect("b"), 2);

        alloc.allocate(a).expect("first");
        alloc.allocate(a).expect("second");
        assert_eq!(alloc.free_pages_on(a).expect("a empty"), 0);

        alloc.allocate(a).expect("third, stolen");
        assert_eq!(alloc.free_pages_on(b).expect("b shrunk"), 1);
        assert_eq!(alloc.stats().steals, 1);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let alloc = make(3, 2);
        let core = CoreId(0);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(alloc.allocate(core).expect("allocate"));
        }

        let err = alloc.allocate(core).expect_err("pool empty");
        assert!(matches!(err, KmmError::OutOfMemory));

        alloc.release(core, held.pop().expect("held")).expect("release");
        alloc.allocate(core).expect("succeeds after release");
    }

    #[test]
    fn release_to_own_list_even_after_steal() {
        let alloc = make(2, 2);
        let a = CoreId(0);
        let b = CoreId(1);

        // Core A drains its own page and steals B's.
        let own = alloc.allocate(a).expect("own");
        let stolen = alloc.allocate(a).expect("stolen");
        assert_eq!(alloc.free_pages_on(b).expect("b"), 0);

        // Releases land on A's list, never back on B's.
        alloc.release(a, own).expect("release own");
        alloc.release(a, stolen).expect("release stolen");
        assert_eq!(alloc.free_pages_on(a).expect("a"), 2);
        assert_eq!(alloc.free_pages_on(b).expect("b"), 0);
    }

    #[test]
    fn bad_addresses_are_fatal() {
        let alloc = make(2, 1);
        let core = CoreId(0);

        let misaligned = PageAddr(0x8000_0001);
        assert!(alloc.release(core, misaligned).expect_err("misaligned").is_fatal());

        let outside = PageAddr(0x9000_0000);
        assert!(alloc.release(core, outside).expect_err("outside").is_fatal());

        let err = alloc.allocate(CoreId(7)).expect_err("foreign core");
        assert!(err.is_fatal());
    }

    #[test]
    fn concurrent_allocate_release_preserves_pool_size() {
        use std::sync::{Arc, Barrier};

        let cores = 4_usize;
        let alloc = Arc::new(make(16, cores));
        let barrier = Arc::new(Barrier::new(cores));

        let handles: Vec<_> = (0..cores)
            .map(|c| {
                let alloc = Arc::clone(&alloc);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let core = CoreId(c);
                    barrier.wait();
                    for _ in 0..500 {
                        match alloc.allocate(core) {
                            Ok(addr) => alloc.release(core, addr).expect("release"),
                            Err(KmmError::OutOfMemory) => {}
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(alloc.free_pages(), 16, "every page must be back on a list");
    }
}
