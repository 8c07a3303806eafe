//! Block pool: a cache of pre-mapped, fixed-size DMA blocks.
//!
//! # Watermarks
//! ```text
//!   pool_size + outstanding < min  ──> blocks_add():  request `increment` blocks
//!   pool_size              > max  ──> blocks_remove(): unmap/free surplus
//! ```
//!
//! Replenishment is asynchronous. Requests go to [`DmaOps::alloc_async`]
//! and their results land in a completion queue owned by the pool;
//! [`BlockPool::poll_completions`] folds them in. The hot path never
//! waits for an allocation.
//!
//! # Locking
//! One lock guards the free-block list, the spare-entry list and the
//! counters. It is held for list/counter manipulation only, never across
//! a [`DmaOps`] call.

use spin::Mutex;
use vxge_list::List;

use crate::block::{BlockEntry, DmaBlock};
use crate::error::{DmaError, Result};
use crate::ops::{AllocCompletion, CompletionQueue, DmaDirection, DmaFlags, DmaMemory, DmaOps};
use crate::PAGE_SIZE;

const TARGET: &str = "vxge::blockpool";

// ============================================================================
// Configuration
// ============================================================================

/// Block pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPoolConfig {
    /// Size of every pooled block in bytes.
    pub block_size: usize,
    /// Blocks allocated at creation.
    pub pool_size: usize,
    /// Blocks requested per replenishment.
    pub pool_incr: usize,
    /// Low watermark.
    pub pool_min: usize,
    /// High watermark.
    pub pool_max: usize,
    /// Attributes passed to the platform on every allocation.
    pub dma_flags: DmaFlags,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            block_size: PAGE_SIZE,
            pool_size: 32,
            pool_incr: 8,
            pool_min: 8,
            pool_max: 128,
            dma_flags: DmaFlags::CONSISTENT,
        }
    }
}

impl BlockPoolConfig {
    /// Page-sized blocks with explicit watermarks.
    pub const fn new(pool_size: usize, pool_incr: usize, pool_min: usize, pool_max: usize) -> Self {
        Self {
            block_size: PAGE_SIZE,
            pool_size,
            pool_incr,
            pool_min,
            pool_max,
            dma_flags: DmaFlags::CONSISTENT,
        }
    }

    /// Smallest useful pool.
    pub const fn minimal() -> Self {
        Self::new(4, 2, 2, 8)
    }

    /// Same watermarks with a different block size.
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Check static invariants.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(DmaError::InvalidConfig("block_size must be non-zero"));
        }
        if self.pool_min > self.pool_max {
            return Err(DmaError::InvalidConfig("pool_min exceeds pool_max"));
        }
        if self.pool_min > 0 && self.pool_incr == 0 {
            return Err(DmaError::InvalidConfig("pool_incr must be non-zero when pool_min is set"));
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPoolStats {
    /// Free blocks in the pool.
    pub pool_size: usize,
    /// Replenishment requests not yet completed.
    pub outstanding: usize,
    /// Spare metadata entries.
    pub spare_entries: usize,
    /// Allocations that bypassed the pool.
    pub slow_path_allocs: u64,
    /// Replenishment requests that failed.
    pub async_failures: u64,
    /// Blocks released by the high-watermark shrink.
    pub blocks_shrunk: u64,
}

// ============================================================================
// Pool
// ============================================================================

struct PoolState {
    free_blocks: List<BlockEntry>,
    spare_entries: List<BlockEntry>,
    spare_cap: usize,
    pool_size: usize,
    req_out: usize,
    slow_path_allocs: u64,
    async_failures: u64,
    blocks_shrunk: u64,
}

impl PoolState {
    /// Pop one free block; its entry goes back to the spare list.
    fn pop_block(&mut self) -> Option<DmaBlock> {
        while let Some(mut entry) = self.free_blocks.pop_front() {
            let block = entry.take_block();
            self.recycle(entry);
            if let Some(block) = block {
                self.pool_size -= 1;
                return Some(block);
            }
        }
        None
    }

    /// Push a block, wrapping it in a spare entry (or a new one if none
    /// is left).
    fn push_block(&mut self, block: DmaBlock) {
        let entry = match self.spare_entries.pop_front() {
            Some(mut entry) => {
                entry.set_block(block);
                entry
            }
            None => BlockEntry::with_block(block),
        };
        self.free_blocks.push_front(entry);
        self.pool_size += 1;
    }

    /// Push an entry that already carries a pool-sized block.
    fn push_entry(&mut self, entry: BlockEntry) {
        self.free_blocks.push_front(entry);
        self.pool_size += 1;
    }

    fn spare_entry(&mut self) -> BlockEntry {
        self.spare_entries.pop_front().unwrap_or_default()
    }

    /// Keep an emptied entry for reuse, up to `spare_cap`.
    fn recycle(&mut self, entry: BlockEntry) {
        if self.spare_entries.len() < self.spare_cap {
            self.spare_entries.push_front(entry);
        }
    }
}

/// Cache of fixed-size, device-mapped DMA blocks.
pub struct BlockPool<D: DmaOps> {
    dma: D,
    config: BlockPoolConfig,
    state: Mutex<PoolState>,
    completions: CompletionQueue,
}

impl<D: DmaOps> BlockPool<D> {
    /// Create a pool holding `config.pool_size` blocks plus
    /// `pool_size + pool_max` spare entries.
    ///
    /// All or nothing: on failure every block already allocated is
    /// unmapped and freed before the error is returned.
    pub fn create(dma: D, config: BlockPoolConfig) -> Result<Self> {
        config.validate()?;

        let spares = config.pool_size + config.pool_max;
        let mut spare_entries = List::with_capacity(spares);
        for _ in 0..spares {
            spare_entries.push_back(BlockEntry::new());
        }

        let pool = Self {
            dma,
            config,
            state: Mutex::new(PoolState {
                free_blocks: List::with_capacity(config.pool_max.max(config.pool_size)),
                spare_entries,
                spare_cap: spares,
                pool_size: 0,
                req_out: 0,
                slow_path_allocs: 0,
                async_failures: 0,
                blocks_shrunk: 0,
            }),
            completions: CompletionQueue::new(),
        };

        for i in 0..config.pool_size {
            match pool.alloc_direct(config.block_size) {
                Ok(block) => pool.state.lock().push_entry(BlockEntry::with_block(block)),
                Err(e) => {
                    log::error!(
                        target: TARGET,
                        "create: block {}/{} failed: {}",
                        i,
                        config.pool_size,
                        e
                    );
                    // Drop releases the blocks allocated so far.
                    return Err(DmaError::OutOfMemory);
                }
            }
        }

        log::debug!(
            target: TARGET,
            "created: block_size={} size={} incr={} min={} max={}",
            config.block_size,
            config.pool_size,
            config.pool_incr,
            config.pool_min,
            config.pool_max
        );
        Ok(pool)
    }

    /// Tear the pool down. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    /// Size of every pooled block.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    #[inline]
    pub fn config(&self) -> &BlockPoolConfig {
        &self.config
    }

    /// The platform DMA services this pool allocates from.
    #[inline]
    pub fn dma(&self) -> &D {
        &self.dma
    }

    /// Free blocks currently cached.
    pub fn pool_size(&self) -> usize {
        self.state.lock().pool_size
    }

    /// Replenishment requests not yet completed.
    pub fn outstanding_requests(&self) -> usize {
        self.state.lock().req_out
    }

    pub fn stats(&self) -> BlockPoolStats {
        let state = self.state.lock();
        BlockPoolStats {
            pool_size: state.pool_size,
            outstanding: state.req_out,
            spare_entries: state.spare_entries.len(),
            slow_path_allocs: state.slow_path_allocs,
            async_failures: state.async_failures,
            blocks_shrunk: state.blocks_shrunk,
        }
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocate a block of `size` bytes.
    ///
    /// Pool-sized requests are served from the cache when possible and
    /// fall back to a direct allocation otherwise; either way the
    /// low-watermark check runs afterwards. Any other size always takes
    /// the direct path, which may block on the platform.
    pub fn malloc(&self, size: usize) -> Result<DmaBlock> {
        if size != self.config.block_size {
            return self.alloc_slow(size);
        }

        let cached = self.state.lock().pop_block();
        let result = match cached {
            Some(block) => Ok(block),
            None => self.alloc_slow(size),
        };
        self.blocks_add();
        result
    }

    /// Return a block.
    ///
    /// Pool-sized blocks go back on the free list, then the high-watermark
    /// check runs. Other blocks are unmapped and freed directly.
    pub fn free(&self, block: DmaBlock) {
        if block.size() != self.config.block_size {
            self.release(block);
            return;
        }
        self.state.lock().push_block(block);
        self.blocks_remove();
    }

    /// Like [`malloc`](Self::malloc), but hands out the metadata entry with
    /// the block so the caller can link it into its own list.
    pub fn block_allocate(&self, size: usize) -> Result<BlockEntry> {
        if size != self.config.block_size {
            let block = self.alloc_slow(size)?;
            let mut entry = self.state.lock().spare_entry();
            entry.set_block(block);
            return Ok(entry);
        }

        let cached = {
            let mut state = self.state.lock();
            match state.free_blocks.pop_front() {
                Some(entry) => {
                    state.pool_size -= 1;
                    Some(entry)
                }
                None => None,
            }
        };
        let result = match cached {
            Some(entry) => Ok(entry),
            None => self.alloc_slow(size).map(|block| {
                let mut entry = self.state.lock().spare_entry();
                entry.set_block(block);
                entry
            }),
        };
        self.blocks_add();
        result
    }

    /// Return an entry obtained from [`block_allocate`](Self::block_allocate)
    /// or [`list_allocate`](Self::list_allocate).
    pub fn block_free(&self, mut entry: BlockEntry) {
        let uniform = matches!(entry.block(), Some(block) if block.size() == self.config.block_size);
        if uniform {
            self.state.lock().push_entry(entry);
            self.blocks_remove();
            return;
        }
        if let Some(block) = entry.take_block() {
            self.release(block);
        }
        self.state.lock().recycle(entry);
    }

    /// Take `count` zeroed blocks at once.
    ///
    /// All or nothing: if the pool holds fewer than `count` blocks every
    /// block taken is put back and `OutOfMemory` is returned. The
    /// low-watermark check runs in both cases.
    pub fn list_allocate(&self, count: usize) -> Result<List<BlockEntry>> {
        let mut taken = List::with_capacity(count);
        let short = {
            let mut state = self.state.lock();
            while taken.len() < count {
                match state.free_blocks.pop_front() {
                    Some(entry) => {
                        state.pool_size -= 1;
                        taken.push_back(entry);
                    }
                    None => break,
                }
            }
            if taken.len() < count {
                while let Some(entry) = taken.pop_back() {
                    state.push_entry(entry);
                }
                true
            } else {
                false
            }
        };

        self.blocks_add();
        if short {
            log::debug!(target: TARGET, "list_allocate: {} blocks not available", count);
            return Err(DmaError::OutOfMemory);
        }

        // Only visits; nothing is unlinked during the walk.
        taken.for_each_safe(|list, id| {
            if let Some(block) = list.get_mut(id).and_then(BlockEntry::block_mut) {
                block.zero();
            }
        });
        Ok(taken)
    }

    /// Return every entry of `list` to the pool.
    pub fn list_free(&self, mut list: List<BlockEntry>) {
        while let Some(entry) = list.pop_front() {
            let uniform = matches!(entry.block(), Some(block) if block.size() == self.config.block_size);
            if uniform {
                self.state.lock().push_entry(entry);
            } else {
                self.block_free(entry);
            }
        }
        self.blocks_remove();
    }

    // ------------------------------------------------------------------------
    // Asynchronous replenishment and shrink
    // ------------------------------------------------------------------------

    /// Low-watermark check: request `pool_incr` blocks when
    /// `pool_size + outstanding < pool_min`.
    pub fn blocks_add(&self) {
        let needed = {
            let mut state = self.state.lock();
            if state.pool_size + state.req_out >= self.config.pool_min {
                return;
            }
            state.req_out += self.config.pool_incr;
            self.config.pool_incr
        };

        log::trace!(target: TARGET, "blocks_add: requesting {} blocks", needed);
        for _ in 0..needed {
            let done = AllocCompletion::new(self.completions.clone(), self.config.block_size);
            self.dma
                .alloc_async(self.config.block_size, self.config.dma_flags, done);
        }
    }

    /// Completion of one replenishment request.
    ///
    /// `None` means the platform failed the allocation; only the
    /// outstanding count changes. Returns true if a block joined the pool.
    pub fn block_add(&self, mem: Option<DmaMemory>) -> bool {
        let block = match mem {
            Some(mem) if mem.len() == self.config.block_size => {
                match self
                    .dma
                    .map(&mem, DmaDirection::Bidirectional, self.config.dma_flags)
                {
                    Ok(dma_addr) => Some(DmaBlock::new(mem, dma_addr)),
                    Err(e) => {
                        log::warn!(target: TARGET, "block_add: map failed: {}", e);
                        self.dma.free(mem);
                        None
                    }
                }
            }
            Some(mem) => {
                log::warn!(
                    target: TARGET,
                    "block_add: got {} bytes, expected {}",
                    mem.len(),
                    self.config.block_size
                );
                self.dma.free(mem);
                None
            }
            None => None,
        };

        let mut state = self.state.lock();
        state.req_out = state.req_out.saturating_sub(1);
        match block {
            Some(block) => {
                state.push_block(block);
                true
            }
            None => {
                state.async_failures += 1;
                log::debug!(target: TARGET, "block_add: replenishment request failed");
                false
            }
        }
    }

    /// Fold in every delivered replenishment result, then re-run both
    /// watermark checks. Returns how many blocks joined the pool.
    pub fn poll_completions(&self) -> usize {
        let mut added = 0;
        loop {
            let Some(result) = self.completions.pop() else {
                break;
            };
            if self.block_add(result) {
                added += 1;
            }
        }
        self.blocks_add();
        self.blocks_remove();
        added
    }

    /// High-watermark check: free cached blocks while `pool_size > pool_max`.
    pub fn blocks_remove(&self) {
        loop {
            let block = {
                let mut state = self.state.lock();
                if state.pool_size <= self.config.pool_max {
                    break;
                }
                match state.pop_block() {
                    Some(block) => {
                        state.blocks_shrunk += 1;
                        block
                    }
                    None => break,
                }
            };
            self.release(block);
        }
    }

    // ------------------------------------------------------------------------
    // Platform
    // ------------------------------------------------------------------------

    fn alloc_slow(&self, size: usize) -> Result<DmaBlock> {
        let block = self.alloc_direct(size)?;
        self.state.lock().slow_path_allocs += 1;
        Ok(block)
    }

    fn alloc_direct(&self, size: usize) -> Result<DmaBlock> {
        let mem = self.dma.alloc(size, self.config.dma_flags)?;
        match self
            .dma
            .map(&mem, DmaDirection::Bidirectional, self.config.dma_flags)
        {
            Ok(dma_addr) => Ok(DmaBlock::new(mem, dma_addr)),
            Err(e) => {
                self.dma.free(mem);
                Err(e)
            }
        }
    }

    fn release(&self, block: DmaBlock) {
        let (mem, dma_addr) = block.into_parts();
        self.dma.unmap(&mem, dma_addr, DmaDirection::Bidirectional);
        self.dma.free(mem);
    }
}

impl<D: DmaOps> Drop for BlockPool<D> {
    fn drop(&mut self) {
        // Delivered but never folded in: allocated, not mapped. Anything
        // completing after this is freed by the sender.
        for mem in self.completions.close().into_iter().flatten() {
            self.dma.free(mem);
        }

        loop {
            let Some(mut entry) = self.state.lock().free_blocks.pop_front() else {
                break;
            };
            if let Some(block) = entry.take_block() {
                self.release(block);
            }
        }

        let mut state = self.state.lock();
        state.spare_entries.clear();
        state.pool_size = 0;
        if state.req_out > 0 {
            log::debug!(
                target: TARGET,
                "destroyed with {} replenishment requests outstanding",
                state.req_out
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapDma;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn pool(config: BlockPoolConfig) -> (Arc<HeapDma>, BlockPool<Arc<HeapDma>>) {
        let dma = Arc::new(HeapDma::new());
        dma.set_deferred(true);
        let pool = BlockPool::create(dma.clone(), config).unwrap();
        (dma, pool)
    }

    #[test]
    fn test_config_validation() {
        assert!(BlockPoolConfig::default().validate().is_ok());
        assert!(BlockPoolConfig::new(4, 2, 9, 8).validate().is_err());
        assert!(BlockPoolConfig::new(4, 0, 2, 8).validate().is_err());
        assert!(BlockPoolConfig::minimal().with_block_size(0).validate().is_err());
    }

    #[test]
    fn test_create_allocates_blocks_and_spares() {
        let (dma, pool) = pool(BlockPoolConfig::minimal());
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 4);
        assert_eq!(stats.spare_entries, 4 + 8);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(dma.stats().allocs, 4);
        assert_eq!(dma.stats().maps, 4);
    }

    #[test]
    fn test_create_rolls_back_on_failure() {
        // Allows two allocations, fails the third.
        struct FailThird {
            inner: HeapDma,
            count: Mutex<usize>,
        }
        impl DmaOps for FailThird {
            fn alloc(&self, size: usize, flags: DmaFlags) -> Result<DmaMemory> {
                let mut count = self.count.lock();
                *count += 1;
                if *count == 3 {
                    return Err(DmaError::OutOfMemory);
                }
                self.inner.alloc(size, flags)
            }
            fn map(&self, mem: &DmaMemory, dir: DmaDirection, flags: DmaFlags) -> Result<u64> {
                self.inner.map(mem, dir, flags)
            }
            fn unmap(&self, mem: &DmaMemory, addr: u64, dir: DmaDirection) {
                self.inner.unmap(mem, addr, dir)
            }
            fn free(&self, mem: DmaMemory) {
                self.inner.free(mem)
            }
        }

        let failing = Arc::new(FailThird {
            inner: HeapDma::new(),
            count: Mutex::new(0),
        });
        let err = BlockPool::create(failing.clone(), BlockPoolConfig::minimal()).err();
        assert_eq!(err, Some(DmaError::OutOfMemory));
        let stats = failing.inner.stats();
        assert_eq!(stats.allocs, 2);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.unmaps, 2);
    }

    #[test]
    fn test_create_map_failure_frees_memory() {
        let dma = Arc::new(HeapDma::new());
        dma.fail_next_maps(1);
        let err = BlockPool::create(dma.clone(), BlockPoolConfig::minimal()).err();
        assert_eq!(err, Some(DmaError::OutOfMemory));
        assert_eq!(dma.stats().live(), 0);
    }

    #[test]
    fn test_malloc_free_round_trip_keeps_pool_size() {
        let config = BlockPoolConfig::new(4, 2, 0, 8);
        let (_dma, pool) = pool(config);
        let block = pool.malloc(PAGE_SIZE).unwrap();
        assert_eq!(pool.pool_size(), 3);
        pool.free(block);
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(pool.outstanding_requests(), 0);
    }

    #[test]
    fn test_drain_then_slow_path() {
        let (dma, pool) = pool(BlockPoolConfig::minimal());
        let mut blocks = Vec::new();
        for _ in 0..4 {
            blocks.push(pool.malloc(PAGE_SIZE).unwrap());
        }
        assert_eq!(pool.pool_size(), 0);
        // Low watermark crossed once: 1 + 0 < 2 after the third malloc.
        assert_eq!(pool.outstanding_requests(), 2);

        let allocs_before = dma.stats().allocs;
        blocks.push(pool.malloc(PAGE_SIZE).unwrap());
        assert_eq!(pool.pool_size(), 0);
        assert_eq!(dma.stats().allocs, allocs_before + 1);
        assert_eq!(pool.stats().slow_path_allocs, 1);

        for block in blocks {
            pool.free(block);
        }
        assert_eq!(pool.pool_size(), 5);
    }

    #[test]
    fn test_non_uniform_size_bypasses_pool() {
        let (dma, pool) = pool(BlockPoolConfig::minimal());
        let block = pool.malloc(100).unwrap();
        assert_eq!(block.size(), 100);
        assert_eq!(pool.pool_size(), 4);
        let frees = dma.stats().frees;
        pool.free(block);
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(dma.stats().frees, frees + 1);
    }

    #[test]
    fn test_async_replenishment() {
        let (dma, pool) = pool(BlockPoolConfig::minimal());
        let a = pool.malloc(PAGE_SIZE).unwrap();
        let b = pool.malloc(PAGE_SIZE).unwrap();
        let c = pool.malloc(PAGE_SIZE).unwrap();
        assert_eq!(pool.pool_size(), 1);
        assert_eq!(pool.outstanding_requests(), 2);
        assert_eq!(dma.deferred_count(), 2);

        // Nothing delivered yet.
        assert_eq!(pool.poll_completions(), 0);
        assert_eq!(pool.pool_size(), 1);

        assert_eq!(dma.complete_deferred(), 2);
        assert_eq!(pool.poll_completions(), 2);
        assert_eq!(pool.pool_size(), 3);
        assert_eq!(pool.outstanding_requests(), 0);

        pool.free(a);
        pool.free(b);
        pool.free(c);
        assert_eq!(pool.pool_size(), 6);
    }

    #[test]
    fn test_async_failure_is_absorbed() {
        let (dma, pool) = pool(BlockPoolConfig::minimal());
        let blocks: Vec<_> = (0..3).map(|_| pool.malloc(PAGE_SIZE).unwrap()).collect();
        assert_eq!(pool.outstanding_requests(), 2);

        dma.fail_next_async(2);
        dma.complete_deferred();
        // Both failed; the re-check issues a fresh request pair.
        assert_eq!(pool.poll_completions(), 0);
        let stats = pool.stats();
        assert_eq!(stats.async_failures, 2);
        assert_eq!(stats.pool_size, 1);
        assert_eq!(stats.outstanding, 2);

        for block in blocks {
            pool.free(block);
        }
    }

    #[test]
    fn test_shrink_above_high_watermark() {
        let config = BlockPoolConfig::new(2, 1, 0, 2);
        let (dma, pool) = pool(config);
        let extra: Vec<_> = (0..3).map(|_| pool.malloc(PAGE_SIZE).unwrap()).collect();
        assert_eq!(pool.pool_size(), 0);
        for block in extra {
            pool.free(block);
        }
        assert_eq!(pool.pool_size(), 2);
        assert_eq!(pool.stats().blocks_shrunk, 1);
        assert_eq!(dma.stats().unmaps, 1);
    }

    #[test]
    fn test_watermarks_hold_at_quiescence() {
        let config = BlockPoolConfig::new(4, 2, 3, 6);
        let (dma, pool) = pool(config);
        let mut held = Vec::new();
        for round in 0..20 {
            if round % 3 == 2 {
                while let Some(block) = held.pop() {
                    pool.free(block);
                }
            } else {
                held.push(pool.malloc(PAGE_SIZE).unwrap());
            }
        }
        while let Some(block) = held.pop() {
            pool.free(block);
        }
        loop {
            dma.complete_deferred();
            pool.poll_completions();
            if dma.deferred_count() == 0 && pool.outstanding_requests() == 0 {
                break;
            }
        }
        let size = pool.pool_size();
        assert!(size >= 3 && size <= 6, "pool_size {} outside [3, 6]", size);
    }

    #[test]
    fn test_block_allocate_keeps_entry() {
        let (_dma, pool) = pool(BlockPoolConfig::minimal());
        let spares = pool.stats().spare_entries;
        let entry = pool.block_allocate(PAGE_SIZE).unwrap();
        assert!(!entry.is_spare());
        assert_eq!(pool.stats().spare_entries, spares);
        pool.block_free(entry);
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(pool.stats().spare_entries, spares);
    }

    #[test]
    fn test_non_uniform_cycles_keep_spare_count() {
        let (_dma, pool) = pool(BlockPoolConfig::minimal());
        let spares = pool.stats().spare_entries;
        for _ in 0..1000 {
            let entry = pool.block_allocate(100).unwrap();
            assert_eq!(entry.block().map(DmaBlock::size), Some(100));
            pool.block_free(entry);
        }
        assert_eq!(pool.stats().spare_entries, spares);
        assert_eq!(pool.stats().slow_path_allocs, 1000);
    }

    #[test]
    fn test_free_without_spare_entry_creates_one() {
        let (_dma, pool) = pool(BlockPoolConfig::new(0, 1, 0, 1));
        assert_eq!(pool.stats().spare_entries, 1);

        let entry = pool.block_allocate(PAGE_SIZE).unwrap();
        assert_eq!(pool.stats().spare_entries, 0);
        let block = pool.malloc(PAGE_SIZE).unwrap();
        assert_eq!(pool.stats().slow_path_allocs, 2);

        pool.free(block);
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 1);
        assert_eq!(stats.spare_entries, 0);

        pool.block_free(entry);
        // Past pool_max: one block is shrunk, its entry kept as a spare.
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 1);
        assert_eq!(stats.blocks_shrunk, 1);
        assert_eq!(stats.spare_entries, 1);
    }

    #[test]
    fn test_late_completion_after_drop_is_freed() {
        let (dma, pool) = pool(BlockPoolConfig::new(3, 2, 2, 8));
        let blocks: Vec<_> = (0..3).map(|_| pool.malloc(PAGE_SIZE).unwrap()).collect();
        assert_eq!(pool.outstanding_requests(), 2);
        assert_eq!(dma.deferred_count(), 2);
        for block in blocks {
            pool.free(block);
        }

        drop(pool);
        assert_eq!(dma.complete_deferred(), 2);
        assert_eq!(dma.stats().live(), 0);
    }

    #[test]
    fn test_list_allocate_all_or_nothing() {
        let (_dma, pool) = pool(BlockPoolConfig::new(4, 2, 0, 8));
        assert_eq!(pool.list_allocate(5).unwrap_err(), DmaError::OutOfMemory);
        assert_eq!(pool.pool_size(), 4);

        let mut list = pool.list_allocate(3).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(pool.pool_size(), 1);
        for entry in list.iter() {
            assert!(entry.block().unwrap().as_slice().iter().all(|&b| b == 0));
        }
        // Dirty one block; it comes back zeroed next time.
        let first = list.first().unwrap();
        list.get_mut(first).unwrap().block_mut().unwrap().as_mut_slice()[0] = 0xFF;
        pool.list_free(list);
        assert_eq!(pool.pool_size(), 4);

        let list = pool.list_allocate(4).unwrap();
        assert!(list
            .iter()
            .all(|entry| entry.block().unwrap().as_slice()[0] == 0));
        pool.list_free(list);
    }

    #[test]
    fn test_drop_releases_everything() {
        let dma = Arc::new(HeapDma::new());
        {
            let pool = BlockPool::create(dma.clone(), BlockPoolConfig::minimal()).unwrap();
            let block = pool.malloc(PAGE_SIZE).unwrap();
            pool.free(block);
            pool.destroy();
        }
        let stats = dma.stats();
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.maps, stats.unmaps);
    }
}
