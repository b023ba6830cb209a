//! The buffer cache.
//!
//! [`BufferCache`] keeps a fixed pool of block buffers partitioned into
//! shards, each protected by its own lock, so requests for unrelated disk
//! regions proceed in parallel. Within a shard, recency is tracked with a
//! per-shard logical clock: every successful lookup or claim stamps the
//! buffer with the incremented clock value, and eviction picks the
//! zero-reference buffer with the smallest stamp.
//!
//! Holding a buffer is witnessed by [`BufferGuard`], which owns the
//! blocking per-buffer lock for its lifetime. The shard lock is never held
//! while waiting for a buffer lock: a lookup bumps the refcount under the
//! shard lock, drops it, and only then blocks on the buffer itself. Dropping
//! the guard decrements the refcount; at zero the buffer becomes an eviction
//! candidate again, ranked by its last claim/lookup stamp.

use crate::BlockDevice;
use kmm_error::{KmmError, Result};
use kmm_types::{BLOCK_SIZE, BlockKey, BlockNumber, DeviceId};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, trace};

/// Shard geometry for a [`BufferCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of independently locked shards.
    pub shards: usize,
    /// Number of buffer slots per shard.
    pub buffers_per_shard: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 13,
            buffers_per_shard: 4,
        }
    }
}

/// Cache counters, cloned out behind the stats lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

#[derive(Debug)]
struct SlotMeta {
    key: Option<BlockKey>,
    refcnt: u32,
    valid: bool,
    last_used: u64,
}

#[derive(Debug)]
struct ShardMeta {
    /// Monotonic logical clock; bumped on every lookup or claim.
    clock: u64,
    slots: Vec<SlotMeta>,
}

struct Shard {
    meta: Mutex<ShardMeta>,
    /// One blocking lock per slot, held across disk I/O by the current
    /// holder. Indexed in lockstep with `meta.slots`.
    payloads: Vec<Mutex<Box<[u8]>>>,
}

impl Shard {
    fn new(buffers: usize) -> Self {
        let slots = (0..buffers)
            .map(|_| SlotMeta {
                key: None,
                refcnt: 0,
                valid: false,
                last_used: 0,
            })
            .collect();
        let payloads = (0..buffers)
            .map(|_| Mutex::new(vec![0_u8; BLOCK_SIZE].into_boxed_slice()))
            .collect();
        Self {
            meta: Mutex::new(ShardMeta { clock: 0, slots }),
            payloads,
        }
    }
}

/// Sharded block cache over a [`BlockDevice`].
pub struct BufferCache {
    shards: Vec<Shard>,
    device: Arc<dyn BlockDevice>,
    stats: Mutex<CacheStats>,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("shards", &self.shards.len())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl BufferCache {
    /// Create a cache with the given geometry over `device`.
    pub fn new(config: CacheConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        if config.shards == 0 {
            return Err(KmmError::InvalidGeometry("shards must be > 0".to_owned()));
        }
        if config.buffers_per_shard == 0 {
            return Err(KmmError::InvalidGeometry(
                "buffers_per_shard must be > 0".to_owned(),
            ));
        }
        info!(
            shards = config.shards,
            buffers_per_shard = config.buffers_per_shard,
            "buffer_cache: initializing"
        );
        let shards = (0..config.shards)
            .map(|_| Shard::new(config.buffers_per_shard))
            .collect();
        Ok(Self {
            shards,
            device,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total buffer slots across all shards.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.payloads.len())
            .sum()
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Number of slots currently claiming `(dev, block)`.
    ///
    /// Diagnostic: while any reference is outstanding this is at most 1 for
    /// any key, over the whole cache.
    #[must_use]
    pub fn resident_count(&self, dev: DeviceId, block: BlockNumber) -> usize {
        let key = BlockKey::new(dev, block);
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .meta
                    .lock()
                    .slots
                    .iter()
                    .filter(|slot| slot.key == Some(key))
                    .count()
            })
            .sum()
    }

    /// Locate or claim a buffer for `(dev, block)` and lock it.
    ///
    /// On a hit the buffer's refcount is bumped and it is stamped
    /// most-recently-used. On a miss the least-recently-used zero-reference
    /// buffer in the shard is repurposed: its key is replaced, its validity
    /// flag cleared, its refcount set to 1. Either way the shard lock is
    /// released before blocking on the per-buffer lock.
    ///
    /// The returned buffer's content is only meaningful if a previous holder
    /// loaded it; use [`BufferCache::read`] for content guaranteed to match
    /// the disk.
    ///
    /// # Errors
    ///
    /// [`KmmError::FatalViolation`] if every buffer in the shard is
    /// referenced: the cache has no victim and the embedding runtime must
    /// halt rather than hand out an aliased buffer.
    pub fn get(&self, dev: DeviceId, block: BlockNumber) -> Result<BufferGuard<'_>> {
        let key = BlockKey::new(dev, block);
        let shard_idx = key.shard_index(self.shards.len());
        let shard = &self.shards[shard_idx];

        let (slot_idx, hit, evicted) = {
            let mut meta = shard.meta.lock();
            meta.clock += 1;
            let stamp = meta.clock;

            if let Some(idx) = meta.slots.iter().position(|slot| slot.key == Some(key)) {
                let slot = &mut meta.slots[idx];
                slot.refcnt += 1;
                slot.last_used = stamp;
                (idx, true, false)
            } else {
                let victim = meta
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.refcnt == 0)
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(idx, _)| idx);
                let Some(idx) = victim else {
                    return Err(KmmError::fatal(format!(
                        "shard {shard_idx}: every buffer referenced, nothing to evict for {key}"
                    )));
                };
                let slot = &mut meta.slots[idx];
                debug_assert_eq!(slot.refcnt, 0, "eviction victim must be unreferenced");
                let evicted = slot.key.is_some();
                slot.key = Some(key);
                slot.refcnt = 1;
                slot.valid = false;
                slot.last_used = stamp;
                (idx, false, evicted)
            }
        };

        {
            let mut stats = self.stats.lock();
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
                if evicted {
                    stats.evictions += 1;
                }
            }
        }
        trace!(
            dev = dev.0,
            block = block.0,
            shard = shard_idx,
            hit,
            "bcache_get"
        );

        let payload = shard.payloads[slot_idx].lock();
        Ok(BufferGuard {
            cache: self,
            shard_idx,
            slot_idx,
            key,
            payload,
        })
    }

    /// Locked buffer with content guaranteed to reflect the disk.
    ///
    /// Calls [`BufferCache::get`] and, if the buffer is not valid, performs
    /// the blocking device read under the buffer lock before returning.
    pub fn read(&self, dev: DeviceId, block: BlockNumber) -> Result<BufferGuard<'_>> {
        let mut guard = self.get(dev, block)?;
        if !self.slot_valid(guard.shard_idx, guard.slot_idx) {
            self.device.read_block(dev, block, &mut guard.payload)?;
            self.set_valid(guard.shard_idx, guard.slot_idx);
            self.stats.lock().disk_reads += 1;
            trace!(dev = dev.0, block = block.0, "bcache_disk_read");
        }
        Ok(guard)
    }

    /// Drop the pin taken by [`BufferGuard::pin`].
    ///
    /// # Errors
    ///
    /// [`KmmError::FatalViolation`] if the pin does not match a resident
    /// buffer or would drive the refcount below zero.
    pub fn unpin(&self, pin: PinnedBuffer) -> Result<()> {
        let shard = self
            .shards
            .get(pin.shard_idx)
            .ok_or_else(|| KmmError::fatal("unpin: pin references unknown shard"))?;
        let mut meta = shard.meta.lock();
        let slot = meta
            .slots
            .get_mut(pin.slot_idx)
            .ok_or_else(|| KmmError::fatal("unpin: pin references unknown slot"))?;
        if slot.key != Some(pin.key) {
            return Err(KmmError::fatal(format!(
                "unpin: buffer {} no longer resident in its slot",
                pin.key
            )));
        }
        if slot.refcnt == 0 {
            return Err(KmmError::fatal(format!(
                "unpin: refcount underflow on buffer {}",
                pin.key
            )));
        }
        slot.refcnt -= 1;
        Ok(())
    }

    fn slot_valid(&self, shard_idx: usize, slot_idx: usize) -> bool {
        self.shards[shard_idx].meta.lock().slots[slot_idx].valid
    }

    fn set_valid(&self, shard_idx: usize, slot_idx: usize) {
        self.shards[shard_idx].meta.lock().slots[slot_idx].valid = true;
    }

    fn bump_refcnt(&self, shard_idx: usize, slot_idx: usize) {
        self.shards[shard_idx].meta.lock().slots[slot_idx].refcnt += 1;
    }

    fn drop_refcnt(&self, shard_idx: usize, slot_idx: usize) {
        let mut meta = self.shards[shard_idx].meta.lock();
        let slot = &mut meta.slots[slot_idx];
        debug_assert!(slot.refcnt > 0, "guard release with zero refcount");
        slot.refcnt = slot.refcnt.saturating_sub(1);
    }
}

/// Exclusive handle on one locked buffer.
///
/// Holds the per-buffer lock for its lifetime; the payload is only
/// reachable through it. Dropping the guard releases the buffer: the
/// refcount drops, and at zero the slot becomes evictable again. Do not
/// hold guards longer than necessary — a second requester of the same
/// block waits on this lock.
#[must_use]
pub struct BufferGuard<'a> {
    cache: &'a BufferCache,
    shard_idx: usize,
    slot_idx: usize,
    key: BlockKey,
    payload: MutexGuard<'a, Box<[u8]>>,
}

impl BufferGuard<'_> {
    /// The `(device, block)` pair this buffer caches.
    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// Block payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable block payload.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Flush the payload to the device (blocking).
    ///
    /// The buffer lock is held by construction; after a successful flush the
    /// buffer is marked valid, since its content now matches the disk.
    pub fn write(&self) -> Result<()> {
        self.cache
            .device
            .write_block(self.key.dev, self.key.block, &self.payload)?;
        self.cache.set_valid(self.shard_idx, self.slot_idx);
        self.cache.stats.lock().disk_writes += 1;
        trace!(
            dev = self.key.dev.0,
            block = self.key.block.0,
            "bcache_disk_write"
        );
        Ok(())
    }

    /// Take an extra reference that outlives this guard.
    ///
    /// Bumps the refcount under the shard lock without touching recency or
    /// the buffer lock, keeping the buffer resident until the matching
    /// [`BufferCache::unpin`]. Used by callers that need the block kept in
    /// cache across I/O performed on someone else's behalf.
    pub fn pin(&self) -> PinnedBuffer {
        self.cache.bump_refcnt(self.shard_idx, self.slot_idx);
        trace!(
            dev = self.key.dev.0,
            block = self.key.block.0,
            "bcache_pin"
        );
        PinnedBuffer {
            shard_idx: self.shard_idx,
            slot_idx: self.slot_idx,
            key: self.key,
        }
    }

    /// Release the buffer. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.cache.drop_refcnt(self.shard_idx, self.slot_idx);
    }
}

impl std::fmt::Debug for BufferGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferGuard")
            .field("key", &self.key)
            .field("shard", &self.shard_idx)
            .finish_non_exhaustive()
    }
}

/// Token for a pinned buffer; redeem with [`BufferCache::unpin`].
#[must_use]
#[derive(Debug)]
pub struct PinnedBuffer {
    shard_idx: usize,
    slot_idx: usize,
    key: BlockKey,
}

impl PinnedBuffer {
    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }
}
