//! Item mempool.
//!
//! Carves fixed-size items out of blocks taken from a [`BlockPool`]. Items
//! are addressed by an explicit `(block_index, slot)` [`ItemHandle`]; the
//! global item index is `block_index * items_per_block + slot`.
//!
//! ```text
//!   block 0: [item 0][item 1] ... [item ipb-1][waste]
//!   block 1: [item ipb] ...
//! ```
//!
//! Each block also gets a zeroed host-side private array with
//! `items_priv_size` bytes per item.
//!
//! The pool grows monotonically up to `memblocks_max` blocks and never
//! shrinks before it is destroyed. It takes no lock of its own; callers
//! serialize access. The block pool underneath is internally locked.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use dma_pool::{BlockPool, DmaBlock, DmaObject, DmaOps};

use crate::config::MempoolConfig;
use crate::error::MempoolError;

const TARGET: &str = "vxge::mempool";

type Result<T> = core::result::Result<T, MempoolError>;

/// Position of an item: block and slot within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemHandle {
    pub block_index: usize,
    pub slot: usize,
}

/// View of one item passed to [`ItemHooks`].
#[derive(Debug)]
pub struct MempoolItem<'a> {
    pub block_index: usize,
    pub slot: usize,
    /// Global item index.
    pub index: usize,
    /// True for the last item created by the `create` or `grow` call in
    /// progress.
    pub is_last: bool,
    /// Mapping of the whole block.
    pub dma: DmaObject,
    /// The item's bytes inside the block.
    pub data: &'a mut [u8],
    /// The item's host-private bytes.
    pub private: &'a mut [u8],
}

impl MempoolItem<'_> {
    /// Bus address of the item's first byte.
    pub fn dma_addr(&self) -> u64 {
        self.dma.dma_addr + (self.slot * self.data.len()) as u64
    }
}

/// Per-item construction and teardown callbacks.
pub trait ItemHooks {
    /// Called once for every item as it is populated. An error aborts the
    /// current step of `create` or `grow`.
    fn item_alloc(&mut self, item: MempoolItem<'_>) -> Result<()> {
        let _ = item;
        Ok(())
    }

    /// Called once for every item on teardown, and for the items already
    /// set up by a step that failed.
    fn item_free(&mut self, item: MempoolItem<'_>) {
        let _ = item;
    }
}

impl ItemHooks for () {}

struct MemBlock {
    block: DmaBlock,
    private: Vec<u8>,
    items: usize,
}

/// Fixed-size items over pooled DMA blocks.
pub struct MemPool<D: DmaOps, H: ItemHooks = ()> {
    pool: Arc<BlockPool<D>>,
    config: MempoolConfig,
    block_size: usize,
    items_per_block: usize,
    memblocks_max: usize,
    memblocks: Vec<MemBlock>,
    items: Vec<Option<ItemHandle>>,
    shadow: Vec<Option<ItemHandle>>,
    items_current: usize,
    hooks: H,
}

impl<D: DmaOps, H: ItemHooks> MemPool<D, H> {
    /// Create a pool populated with exactly `config.items_initial` items.
    ///
    /// On failure everything already set up is torn down, free hooks
    /// included, before the error is returned.
    pub fn create(pool: Arc<BlockPool<D>>, config: MempoolConfig, hooks: H) -> Result<Self> {
        let block_size = pool.block_size();
        config.validate(block_size)?;

        let items_per_block = config.items_per_block(block_size);
        let memblocks_max = config.items_max.div_ceil(items_per_block);

        let mut memblocks = Vec::new();
        memblocks
            .try_reserve_exact(memblocks_max)
            .map_err(|_| MempoolError::OutOfMemory)?;
        let items = none_array(config.items_max)?;
        let shadow = none_array(config.items_max)?;

        let mut mempool = Self {
            pool,
            config,
            block_size,
            items_per_block,
            memblocks_max,
            memblocks,
            items,
            shadow,
            items_current: 0,
            hooks,
        };

        mempool.fill_to(config.items_initial)?;

        log::debug!(
            target: TARGET,
            "created: item_size={} items_per_block={} items={} blocks={}/{}",
            config.item_size,
            items_per_block,
            mempool.items_current,
            mempool.memblocks.len(),
            memblocks_max
        );
        Ok(mempool)
    }

    /// Tear the pool down. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    /// Add `num_allocate` blocks' worth of items, capped by `items_max`.
    ///
    /// A partly filled last block is filled first and counts as one of
    /// the `num_allocate`, so the populated items always stay dense in
    /// `[0, item_count())`. If an item hook fails, the items set up by
    /// that step are freed in reverse and `OutOfMemory` is returned; a
    /// new block goes back to the pool, a topped-up block keeps the items
    /// it held before. Steps completed earlier in the same call stay.
    /// Growing past `memblocks_max` is refused without changing anything.
    /// Returns the number of items added.
    pub fn grow(&mut self, num_allocate: usize) -> Result<usize> {
        if num_allocate == 0 {
            return Ok(0);
        }
        let partial = self.has_room_in_last_block();
        let new_blocks = num_allocate - usize::from(partial);
        if self.memblocks.len() + new_blocks > self.memblocks_max {
            log::debug!(
                target: TARGET,
                "grow: {} + {} blocks exceeds max {}",
                self.memblocks.len(),
                new_blocks,
                self.memblocks_max
            );
            return Err(MempoolError::OutOfMemory);
        }

        let target = ((self.memblocks.len() + new_blocks) * self.items_per_block)
            .min(self.config.items_max);
        self.fill_to(target)
    }

    /// Populate items until `target` are live.
    fn fill_to(&mut self, target: usize) -> Result<usize> {
        let before = self.items_current;
        if self.has_room_in_last_block() {
            self.top_up(target)?;
        }
        while self.items_current < target {
            self.add_block(target)?;
        }
        Ok(self.items_current - before)
    }

    fn has_room_in_last_block(&self) -> bool {
        self.memblocks
            .last()
            .is_some_and(|mb| mb.items < self.items_per_block && self.items_current < self.config.items_max)
    }

    fn top_up(&mut self, target: usize) -> Result<()> {
        let layout = self.layout();
        let block_index = self.memblocks.len() - 1;
        let first = block_index * self.items_per_block;
        let end = target.saturating_sub(first).min(self.items_per_block);
        let mb = &mut self.memblocks[block_index];
        let start = mb.items;
        if end <= start {
            return Ok(());
        }

        populate(
            &mut self.hooks,
            &mut mb.block,
            &mut mb.private,
            layout,
            block_index,
            start..end,
            target - 1,
        )?;
        mb.items = end;
        self.commit(block_index, start..end);
        log::trace!(target: TARGET, "grow: block {} topped up to {} items", block_index, end);
        Ok(())
    }

    fn add_block(&mut self, target: usize) -> Result<()> {
        let block_index = self.memblocks.len();
        let first = block_index * self.items_per_block;
        let count = target.saturating_sub(first).min(self.items_per_block);

        let priv_size = self.config.items_priv_size;
        let mut private = Vec::new();
        private
            .try_reserve_exact(self.items_per_block * priv_size)
            .map_err(|_| MempoolError::OutOfMemory)?;
        private.resize(self.items_per_block * priv_size, 0u8);

        let mut block = self.pool.malloc(self.block_size)?;
        block.zero();
        let layout = self.layout();

        if let Err(e) = populate(
            &mut self.hooks,
            &mut block,
            &mut private,
            layout,
            block_index,
            0..count,
            target - 1,
        ) {
            self.pool.free(block);
            return Err(e);
        }

        self.memblocks.push(MemBlock {
            block,
            private,
            items: count,
        });
        self.commit(block_index, 0..count);
        log::trace!(target: TARGET, "grow: block {} holds {} items", block_index, count);
        Ok(())
    }

    fn commit(&mut self, block_index: usize, slots: Range<usize>) {
        let first = block_index * self.items_per_block;
        let added = slots.len();
        for slot in slots {
            let handle = ItemHandle { block_index, slot };
            self.items[first + slot] = Some(handle);
            self.shadow[first + slot] = Some(handle);
        }
        self.items_current += added;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Items currently populated.
    #[inline]
    pub fn item_count(&self) -> usize {
        self.items_current
    }

    /// Handle stored at global index `index`. `None` past the populated
    /// range.
    pub fn item(&self, index: usize) -> Option<ItemHandle> {
        self.items.get(index).copied().flatten()
    }

    /// Bytes of an item.
    pub fn item_data(&self, handle: ItemHandle) -> Option<&[u8]> {
        let mb = self.live_block(handle)?;
        let start = handle.slot * self.config.item_size;
        mb.block.as_slice().get(start..start + self.config.item_size)
    }

    pub fn item_data_mut(&mut self, handle: ItemHandle) -> Option<&mut [u8]> {
        let item_size = self.config.item_size;
        self.live_block(handle)?;
        let start = handle.slot * item_size;
        self.memblocks
            .get_mut(handle.block_index)?
            .block
            .as_mut_slice()
            .get_mut(start..start + item_size)
    }

    /// Bus address of an item.
    pub fn item_dma_addr(&self, handle: ItemHandle) -> Option<u64> {
        let mb = self.live_block(handle)?;
        Some(mb.block.dma_addr() + (handle.slot * self.config.item_size) as u64)
    }

    /// Host-private bytes of item `slot` in block `block_index`.
    pub fn item_priv(&self, block_index: usize, slot: usize) -> Option<&[u8]> {
        let size = self.config.items_priv_size;
        let mb = self.live_block(ItemHandle { block_index, slot })?;
        mb.private.get(slot * size..(slot + 1) * size)
    }

    pub fn item_priv_mut(&mut self, block_index: usize, slot: usize) -> Option<&mut [u8]> {
        let size = self.config.items_priv_size;
        self.live_block(ItemHandle { block_index, slot })?;
        self.memblocks
            .get_mut(block_index)?
            .private
            .get_mut(slot * size..(slot + 1) * size)
    }

    /// Global index of an item.
    #[inline]
    pub fn item_index_of(&self, handle: ItemHandle) -> usize {
        handle.block_index * self.items_per_block + handle.slot
    }

    /// Item at byte `offset` into block `block_index`.
    ///
    /// `offset` must come from an item of this pool.
    pub fn handle_from_offset(&self, block_index: usize, offset: usize) -> ItemHandle {
        let slot = offset / self.config.item_size;
        debug_assert!(
            slot < self.items_per_block,
            "offset {} outside the items of block {}",
            offset,
            block_index
        );
        ItemHandle { block_index, slot }
    }

    /// The items array. Callers may reorder it; teardown does not depend
    /// on it.
    pub fn items(&self) -> &[Option<ItemHandle>] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [Option<ItemHandle>] {
        &mut self.items
    }

    pub fn memblock(&self, index: usize) -> Option<&DmaBlock> {
        self.memblocks.get(index).map(|mb| &mb.block)
    }

    pub fn memblock_dma(&self, index: usize) -> Option<DmaObject> {
        self.memblocks.get(index).map(|mb| mb.block.dma_object())
    }

    #[inline]
    pub fn items_per_block(&self) -> usize {
        self.items_per_block
    }

    #[inline]
    pub fn memblocks_allocated(&self) -> usize {
        self.memblocks.len()
    }

    #[inline]
    pub fn memblocks_max(&self) -> usize {
        self.memblocks_max
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.config.item_size
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    fn layout(&self) -> Layout {
        Layout {
            items_per_block: self.items_per_block,
            item_size: self.config.item_size,
            priv_size: self.config.items_priv_size,
        }
    }

    fn live_block(&self, handle: ItemHandle) -> Option<&MemBlock> {
        self.memblocks
            .get(handle.block_index)
            .filter(|mb| handle.slot < mb.items)
    }
}

impl<D: DmaOps, H: ItemHooks> Drop for MemPool<D, H> {
    fn drop(&mut self) {
        let layout = self.layout();
        let memblocks = core::mem::take(&mut self.memblocks);

        for (block_index, mb) in memblocks.into_iter().enumerate() {
            let MemBlock {
                mut block,
                mut private,
                items,
            } = mb;
            let dma = block.dma_object();
            let first = block_index * self.items_per_block;
            for index in first..first + items {
                let Some(handle) = self.shadow.get(index).copied().flatten() else {
                    continue;
                };
                let item = item_view(&mut block, &mut private, dma, layout, block_index, handle.slot, false);
                self.hooks.item_free(item);
            }
            self.pool.free(block);
        }

        log::debug!(target: TARGET, "destroyed: {} items released", self.items_current);
        self.items_current = 0;
    }
}

#[derive(Clone, Copy)]
struct Layout {
    items_per_block: usize,
    item_size: usize,
    priv_size: usize,
}

fn item_view<'a>(
    block: &'a mut DmaBlock,
    private: &'a mut [u8],
    dma: DmaObject,
    layout: Layout,
    block_index: usize,
    slot: usize,
    is_last: bool,
) -> MempoolItem<'a> {
    let Layout {
        items_per_block,
        item_size,
        priv_size,
    } = layout;
    MempoolItem {
        block_index,
        slot,
        index: block_index * items_per_block + slot,
        is_last,
        dma,
        data: &mut block.as_mut_slice()[slot * item_size..(slot + 1) * item_size],
        private: &mut private[slot * priv_size..(slot + 1) * priv_size],
    }
}

/// Run `item_alloc` over `slots` of one block. On failure the slots
/// already set up are handed to `item_free` in reverse.
fn populate<H: ItemHooks>(
    hooks: &mut H,
    block: &mut DmaBlock,
    private: &mut [u8],
    layout: Layout,
    block_index: usize,
    slots: Range<usize>,
    last_index: usize,
) -> Result<()> {
    let dma = block.dma_object();
    let first = block_index * layout.items_per_block;
    let start = slots.start;

    for slot in slots {
        let index = first + slot;
        let item = item_view(block, private, dma, layout, block_index, slot, index == last_index);
        if let Err(e) = hooks.item_alloc(item) {
            log::warn!(
                target: TARGET,
                "grow: item {} setup failed ({}), unwinding block {}",
                index,
                e,
                block_index
            );
            for undo in (start..slot).rev() {
                let item = item_view(block, private, dma, layout, block_index, undo, false);
                hooks.item_free(item);
            }
            return Err(MempoolError::OutOfMemory);
        }
    }
    Ok(())
}

fn none_array(len: usize) -> Result<Vec<Option<ItemHandle>>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| MempoolError::OutOfMemory)?;
    v.resize(len, None);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_pool::{BlockPoolConfig, HeapDma};

    /// Records hook calls; fails `item_alloc` at a chosen global index.
    #[derive(Default)]
    struct Recorder {
        allocated: Vec<usize>,
        freed: Vec<usize>,
        last: Vec<usize>,
        fail_at: Option<usize>,
    }

    impl ItemHooks for Recorder {
        fn item_alloc(&mut self, item: MempoolItem<'_>) -> Result<()> {
            if self.fail_at == Some(item.index) {
                return Err(MempoolError::OutOfMemory);
            }
            item.data[0] = 0xA5;
            item.private.fill(item.slot as u8);
            if item.is_last {
                self.last.push(item.index);
            }
            self.allocated.push(item.index);
            Ok(())
        }

        fn item_free(&mut self, item: MempoolItem<'_>) {
            self.freed.push(item.index);
        }
    }

    fn blockpool() -> Arc<BlockPool<Arc<HeapDma>>> {
        let dma = Arc::new(HeapDma::new());
        Arc::new(BlockPool::create(dma, BlockPoolConfig::new(4, 2, 0, 16)).unwrap())
    }

    #[test]
    fn test_create_populates_exactly_initial() {
        let config = MempoolConfig::new(64, 100, 1000);
        let mp = MemPool::create(blockpool(), config, ()).unwrap();
        assert_eq!(mp.items_per_block(), 64);
        assert_eq!(mp.memblocks_max(), 16);
        assert_eq!(mp.item_count(), 100);
        assert_eq!(mp.memblocks_allocated(), 2);
        assert!(mp.item(99).is_some());
        assert!(mp.item(100).is_none());
    }

    #[test]
    fn test_item_addressing() {
        let config = MempoolConfig::new(128, 64, 64).with_priv_size(8);
        let mut mp = MemPool::create(blockpool(), config, Recorder::default()).unwrap();
        assert_eq!(mp.items_per_block(), 32);

        let handle = mp.item(40).unwrap();
        assert_eq!(handle, ItemHandle { block_index: 1, slot: 8 });
        assert_eq!(mp.item_index_of(handle), 40);
        assert_eq!(mp.handle_from_offset(1, 8 * 128), handle);
        assert_eq!(mp.handle_from_offset(1, 8 * 128 + 127), handle);

        let base = mp.memblock_dma(1).unwrap().dma_addr;
        assert_eq!(mp.item_dma_addr(handle), Some(base + 8 * 128));
        assert_eq!(mp.item_data(handle).unwrap()[0], 0xA5);
        assert_eq!(mp.item_priv(1, 8).unwrap(), &[8u8; 8]);

        mp.item_data_mut(handle).unwrap()[1] = 7;
        let offset = 8 * 128;
        assert_eq!(mp.memblock(1).unwrap().as_slice()[offset + 1], 7);
    }

    #[test]
    fn test_grow_after_partial_create_keeps_items_dense() {
        let config = MempoolConfig::new(64, 100, 1000);
        let mut mp = MemPool::create(blockpool(), config, Recorder::default()).unwrap();
        assert_eq!(mp.memblocks_allocated(), 2);

        // Finishing block 1 counts as the one block asked for.
        assert_eq!(mp.grow(1).unwrap(), 28);
        assert_eq!(mp.item_count(), 128);
        assert_eq!(mp.memblocks_allocated(), 2);
        assert_eq!(mp.grow(1).unwrap(), 64);
        assert_eq!(mp.item_count(), 192);

        for i in 0..mp.item_count() {
            let handle = mp.item(i).unwrap();
            assert_eq!(mp.item_index_of(handle), i);
            assert!(mp.item_data(handle).is_some());
        }
        assert!(mp.item(mp.item_count()).is_none());
        let expected: Vec<usize> = (0..192).collect();
        assert_eq!(mp.hooks().allocated, expected);
    }

    #[test]
    fn test_top_up_failure_keeps_earlier_items() {
        let config = MempoolConfig::new(1024, 2, 16);
        let mut mp = MemPool::create(blockpool(), config, Recorder::default()).unwrap();
        mp.hooks_mut().fail_at = Some(3);

        assert_eq!(mp.grow(1).unwrap_err(), MempoolError::OutOfMemory);
        assert_eq!(mp.hooks().freed, [2]);
        assert_eq!(mp.memblocks_allocated(), 1);
        assert_eq!(mp.item_count(), 2);
        assert!(mp.item(2).is_none());

        mp.hooks_mut().fail_at = None;
        assert_eq!(mp.grow(1).unwrap(), 2);
        assert_eq!(mp.item_count(), 4);
    }

    #[test]
    fn test_last_item_flag_once_per_call() {
        let config = MempoolConfig::new(64, 192, 1000);
        let mut mp = MemPool::create(blockpool(), config, Recorder::default()).unwrap();
        assert_eq!(mp.memblocks_allocated(), 3);
        assert_eq!(mp.hooks().last, [191]);

        mp.grow(2).unwrap();
        assert_eq!(mp.hooks().last, [191, 319]);
    }

    #[test]
    fn test_partial_block_at_max_can_still_be_filled() {
        let config = MempoolConfig::new(1024, 6, 8);
        let mut mp = MemPool::create(blockpool(), config, ()).unwrap();
        assert_eq!(mp.memblocks_allocated(), mp.memblocks_max());
        assert_eq!(mp.grow(1).unwrap(), 2);
        assert_eq!(mp.item_count(), 8);
        assert_eq!(mp.grow(1).unwrap_err(), MempoolError::OutOfMemory);
    }

    #[test]
    fn test_grow_until_exhausted() {
        let config = MempoolConfig::new(1024, 4, 12);
        let mut mp = MemPool::create(blockpool(), config, ()).unwrap();
        assert_eq!(mp.memblocks_max(), 3);
        assert_eq!(mp.grow(2).unwrap(), 8);
        assert_eq!(mp.item_count(), 12);
        assert_eq!(mp.grow(1).unwrap_err(), MempoolError::OutOfMemory);
        assert_eq!(mp.item_count(), 12);
    }

    #[test]
    fn test_grow_past_max_changes_nothing() {
        let config = MempoolConfig::new(1024, 4, 12);
        let mut mp = MemPool::create(blockpool(), config, ()).unwrap();
        assert!(mp.grow(3).is_err());
        assert_eq!(mp.memblocks_allocated(), 1);
        assert_eq!(mp.item_count(), 4);
    }

    #[test]
    fn test_hook_failure_unwinds_block_only() {
        let config = MempoolConfig::new(1024, 4, 16);
        let mut mp = MemPool::create(blockpool(), config, Recorder::default()).unwrap();
        mp.hooks_mut().fail_at = Some(10);

        // Block 1 commits, block 2 fails at its third item.
        assert_eq!(mp.grow(2).unwrap_err(), MempoolError::OutOfMemory);
        assert_eq!(mp.memblocks_allocated(), 2);
        assert_eq!(mp.item_count(), 8);
        assert_eq!(mp.hooks().freed, [9, 8]);
        assert!(mp.item(8).is_none());
        assert!(mp.item(7).is_some());
    }

    #[test]
    fn test_create_failure_tears_down() {
        let pool = blockpool();
        let config = MempoolConfig::new(1024, 8, 16);
        let hooks = Recorder {
            fail_at: Some(6),
            ..Recorder::default()
        };
        let before = pool.pool_size();
        assert!(MemPool::create(pool.clone(), config, hooks).is_err());
        assert_eq!(pool.pool_size(), before);
    }

    #[test]
    fn test_drop_frees_each_item_once() {
        let pool = blockpool();
        let config = MempoolConfig::new(1024, 6, 16);
        let mut mp = MemPool::create(pool.clone(), config, Recorder::default()).unwrap();
        // Reordering the items array does not affect teardown.
        mp.items_mut().reverse();

        let mut freed = Vec::new();
        struct Collect<'a>(&'a mut Vec<usize>);
        impl ItemHooks for Collect<'_> {
            fn item_free(&mut self, item: MempoolItem<'_>) {
                self.0.push(item.index);
            }
        }
        {
            let mp2 = MemPool::create(pool.clone(), config, Collect(&mut freed)).unwrap();
            mp2.destroy();
        }
        assert_eq!(freed, [0, 1, 2, 3, 4, 5]);

        assert_eq!(mp.hooks().allocated.len(), 6);
        drop(mp);
        assert_eq!(pool.pool_size(), 4);
    }
}
