#![forbid(unsafe_code)]
//! kmm public API facade.
//!
//! Re-exports the block cache, the page allocator, and their shared types
//! through one stable interface. This is the crate downstream consumers
//! (filesystem layer, address-space manager, harness) depend on.

pub use kmm_bcache::{
    BlockDevice, BufferCache, BufferGuard, CacheConfig, CacheStats, FileBlockDevice,
    PinnedBuffer, RamDisk,
};
pub use kmm_error::{KmmError, Result};
pub use kmm_palloc::{
    ALLOC_FILL, AllocPolicy, AllocStats, FREE_FILL, FrameArena, PageAllocator,
    PerCoreAllocator, RefCountAllocator, build_allocator,
};
pub use kmm_types::{
    BLOCK_SIZE, BlockKey, BlockNumber, CoreId, DeviceId, PAGE_SIZE, PageAddr, PhysRange,
};
