#![forbid(unsafe_code)]
//! Stress harness for the kmm memory core.
//!
//! Provides deterministic, seeded multi-thread workloads over the block
//! cache and the page allocator, each producing a JSON-serializable report.
//! The workloads assert the core's observable invariants (uniform block
//! payloads under single-writer exclusion, conservation of the page pool)
//! and fail loudly when one breaks.

use anyhow::{Context, Result, bail};
use kmm::{
    AllocPolicy, AllocStats, BlockNumber, BufferCache, CacheConfig, CacheStats, CoreId,
    DeviceId, PAGE_SIZE, PageAddr, PageAllocator, PhysRange, RamDisk, build_allocator,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Barrier};
use std::time::Instant;

/// Seeded xorshift generator so stress runs are reproducible.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 0
    }

    pub fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive <= 1 {
            return 0;
        }
        let upper_u64 = u64::try_from(upper_exclusive).unwrap_or(u64::MAX);
        let value = self.next_u64() % upper_u64;
        usize::try_from(value).unwrap_or(0)
    }
}

fn derive_thread_seed(base_seed: u64, thread_id: usize) -> u64 {
    let id = u64::try_from(thread_id).unwrap_or(u64::MAX);
    base_seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ── Cache stress ────────────────────────────────────────────────────────────

/// Configuration for [`run_cache_stress`].
#[derive(Debug, Clone)]
pub struct CacheStressConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    /// Distinct blocks the workload touches (also the RamDisk size).
    pub blocks: u64,
    pub shards: usize,
    pub buffers_per_shard: usize,
    pub seed: u64,
}

impl Default for CacheStressConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            ops_per_thread: 2_000,
            blocks: 64,
            shards: 13,
            buffers_per_shard: 8,
            seed: 0x5EED_0000_0000_0001,
        }
    }
}

/// Result of a cache stress run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStressReport {
    pub threads: usize,
    pub total_ops: usize,
    pub reads: u64,
    pub writes: u64,
    pub stats: CacheStats,
    pub duration_us: u64,
}

/// Hammer one cache from many threads with mixed reads and whole-block
/// writes, verifying that every observed payload is uniform (the
/// single-writer guarantee of the per-buffer lock).
pub fn run_cache_stress(config: &CacheStressConfig) -> Result<CacheStressReport> {
    if config.threads == 0 {
        bail!("cache stress requires at least one thread");
    }
    if config.buffers_per_shard < config.threads {
        // Each thread holds at most one buffer; with fewer slots than
        // threads a single shard could have every buffer referenced at
        // once, which the cache treats as fatal exhaustion.
        bail!(
            "buffers_per_shard ({}) must be >= threads ({})",
            config.buffers_per_shard,
            config.threads
        );
    }
    let disk = Arc::new(RamDisk::new(config.blocks));
    let cache = Arc::new(
        BufferCache::new(
            CacheConfig {
                shards: config.shards,
                buffers_per_shard: config.buffers_per_shard,
            },
            disk,
        )
        .context("building cache")?,
    );
    let dev = DeviceId(1);
    let barrier = Arc::new(Barrier::new(config.threads));
    let started = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let blocks = config.blocks;
            let ops = config.ops_per_thread;
            let seed = derive_thread_seed(config.seed, thread_id);
            std::thread::spawn(move || -> Result<(u64, u64)> {
                let mut rng = DeterministicRng::new(seed);
                let mut reads = 0_u64;
                let mut writes = 0_u64;
                barrier.wait();
                for _ in 0..ops {
                    let block =
                        BlockNumber(rng.next_u64() % blocks.max(1));
                    if rng.next_bool() {
                        let guard = cache
                            .read(dev, block)
                            .context("stress read")?;
                        let bytes = guard.data();
                        let first = bytes[0];
                        if bytes.iter().any(|&b| b != first) {
                            bail!("torn block payload at {block}: writer exclusion broken");
                        }
                        reads += 1;
                    } else {
                        let fill = u8::try_from(rng.next_usize(256)).unwrap_or(0);
                        let mut guard = cache
                            .read(dev, block)
                            .context("stress write")?;
                        guard.data_mut().fill(fill);
                        guard.write().context("stress flush")?;
                        writes += 1;
                    }
                }
                Ok((reads, writes))
            })
        })
        .collect();

    let mut reads = 0_u64;
    let mut writes = 0_u64;
    for handle in handles {
        let (r, w) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("stress thread panicked"))??;
        reads += r;
        writes += w;
    }

    Ok(CacheStressReport {
        threads: config.threads,
        total_ops: config.threads * config.ops_per_thread,
        reads,
        writes,
        stats: cache.stats(),
        duration_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
    })
}

// ── Allocator stress ────────────────────────────────────────────────────────

/// Configuration for [`run_alloc_stress`].
#[derive(Debug, Clone)]
pub struct AllocStressConfig {
    pub policy: AllocPolicy,
    pub cores: usize,
    pub pages: u64,
    pub ops_per_thread: usize,
    pub seed: u64,
}

impl Default for AllocStressConfig {
    fn default() -> Self {
        Self {
            policy: AllocPolicy::PerCore,
            cores: 4,
            pages: 64,
            ops_per_thread: 5_000,
            seed: 0x5EED_0000_0000_0002,
        }
    }
}

/// Result of an allocator stress run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocStressReport {
    pub policy: String,
    pub cores: usize,
    pub pages: u64,
    pub out_of_memory_hits: u64,
    pub stats: AllocStats,
    pub final_free_pages: usize,
    pub duration_us: u64,
}

/// One thread per core randomly allocating and releasing pages, then
/// draining its holdings; afterwards every page must be back on a free
/// list.
pub fn run_alloc_stress(config: &AllocStressConfig) -> Result<AllocStressReport> {
    if config.cores == 0 {
        bail!("alloc stress requires at least one core");
    }
    let base = 0x8000_0000_u64;
    let range = PhysRange::new(
        PageAddr(base),
        PageAddr(base + config.pages * PAGE_SIZE as u64),
    )
    .map_err(|e| anyhow::anyhow!("building range: {e}"))?;
    let alloc = Arc::new(
        build_allocator(config.policy, range, config.cores).context("building allocator")?,
    );
    let barrier = Arc::new(Barrier::new(config.cores));
    let started = Instant::now();

    let handles: Vec<_> = (0..config.cores)
        .map(|core_id| {
            let alloc = Arc::clone(&alloc);
            let barrier = Arc::clone(&barrier);
            let ops = config.ops_per_thread;
            let seed = derive_thread_seed(config.seed, core_id);
            std::thread::spawn(move || -> Result<u64> {
                let core = CoreId(core_id);
                let mut rng = DeterministicRng::new(seed);
                let mut held: Vec<PageAddr> = Vec::new();
                let mut oom = 0_u64;
                barrier.wait();
                for _ in 0..ops {
                    if held.is_empty() || rng.next_bool() {
                        match alloc.allocate(core) {
                            Ok(addr) => held.push(addr),
                            Err(kmm::KmmError::OutOfMemory) => oom += 1,
                            Err(other) => bail!("unexpected allocator error: {other}"),
                        }
                    } else {
                        let index = rng.next_usize(held.len());
                        let addr = held.swap_remove(index);
                        alloc.release(core, addr).context("stress release")?;
                    }
                }
                for addr in held {
                    alloc.release(core, addr).context("drain release")?;
                }
                Ok(oom)
            })
        })
        .collect();

    let mut oom = 0_u64;
    for handle in handles {
        oom += handle
            .join()
            .map_err(|_| anyhow::anyhow!("stress thread panicked"))??;
    }

    let final_free = alloc.free_pages();
    let expected = usize::try_from(config.pages).unwrap_or(usize::MAX);
    if final_free != expected {
        bail!("page pool leaked: {final_free} free of {expected}");
    }

    Ok(AllocStressReport {
        policy: match config.policy {
            AllocPolicy::PerCore => "per-core".to_owned(),
            AllocPolicy::RefCounted => "ref-counted".to_owned(),
        },
        cores: config.cores,
        pages: config.pages,
        out_of_memory_hits: oom,
        stats: alloc.stats(),
        final_free_pages: final_free,
        duration_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_is_deterministic() {
        let mut a = DeterministicRng::new(42);
        let mut b = DeterministicRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn rng_bounded_draws_stay_in_range() {
        let mut rng = DeterministicRng::new(7);
        for _ in 0..1_000 {
            assert!(rng.next_usize(13) < 13);
        }
        assert_eq!(rng.next_usize(0), 0);
        assert_eq!(rng.next_usize(1), 0);
    }

    #[test]
    fn thread_seeds_differ() {
        let base = 0xABCD;
        assert_ne!(derive_thread_seed(base, 0), derive_thread_seed(base, 1));
        assert_ne!(derive_thread_seed(base, 1), derive_thread_seed(base, 2));
    }
}
