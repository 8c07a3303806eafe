//! Descriptor queues.
//!
//! A [`DescQueue`] binds the slots of a [`Channel`] to descriptor items of
//! a [`MemPool`]: slot `i` carries the handle of item `i`. Posting a slot
//! rings the queue's [`Doorbell`] with the bus address of its descriptor.
//!
//! A queue may open with only part of its descriptors bound, when the
//! pool could not supply every block at once. It refuses reservations
//! until [`DescQueue::replenish`] has bound the rest.

use alloc::sync::Arc;

use dma_pool::{BlockPool, DmaOps};
use vxge_channel::{Channel, ChannelStats, Descriptor};

use crate::config::{ChannelConfig, MempoolConfig};
use crate::error::{HalError, Result};
use crate::mempool::{ItemHandle, MemPool};

const TARGET: &str = "vxge::queue";

/// Hardware notification that descriptors were posted.
pub trait Doorbell {
    /// Slot `index` was posted; its descriptor sits at `dma_addr`.
    fn ring(&mut self, index: usize, dma_addr: u64);
}

/// Descriptor ring over pooled descriptor memory.
pub struct DescQueue<D: DmaOps, B: Doorbell> {
    mempool: MemPool<D>,
    channel: Channel<ItemHandle>,
    doorbell: B,
    bound: usize,
}

impl<D: DmaOps, B: Doorbell> DescQueue<D, B> {
    /// Build a queue with `config.initial_descriptors` descriptors bound,
    /// rounded up to whole blocks.
    pub fn create(pool: Arc<BlockPool<D>>, config: ChannelConfig, doorbell: B) -> Result<Self> {
        config.validate()?;

        let per_block = pool.block_size() / config.desc_size;
        if per_block == 0 {
            return Err(HalError::InvalidConfig("desc_size exceeds block size"));
        }
        // Whole blocks only, so bound items stay contiguous.
        let initial = config
            .initial_descriptors
            .div_ceil(per_block)
            .saturating_mul(per_block)
            .min(config.length);

        let mempool = MemPool::create(
            pool,
            MempoolConfig::new(config.desc_size, initial, config.length),
            (),
        )?;
        let channel = Channel::allocate(
            config.channel_type,
            config.length,
            config.per_item_space,
            (),
        )?;

        let mut queue = Self {
            mempool,
            channel,
            doorbell,
            bound: 0,
        };
        queue.bind()?;
        log::debug!(
            target: TARGET,
            "created {:?} queue: length={} bound={}",
            config.channel_type,
            config.length,
            queue.bound
        );
        Ok(queue)
    }

    /// Every slot has a descriptor.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.bound == self.channel.length()
    }

    /// Slots bound to a descriptor.
    #[inline]
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Grow descriptor memory until every slot is bound. Returns the
    /// number of slots newly bound.
    ///
    /// Fails with a transient error when the pool runs dry; whatever was
    /// bound before the failure stays bound.
    pub fn replenish(&mut self) -> Result<usize> {
        let before = self.bound;
        while !self.is_ready() {
            let grown = self.mempool.grow(1);
            self.bind()?;
            grown?;
        }
        Ok(self.bound - before)
    }

    /// Attach the channel to its owner.
    pub fn initialize(&mut self, owner: usize) {
        self.channel.initialize(owner);
    }

    pub fn terminate(&mut self) {
        self.channel.terminate();
    }

    /// Reserve the next descriptor.
    pub fn reserve(&mut self) -> Result<Descriptor<ItemHandle>> {
        if !self.is_ready() {
            return Err(HalError::QueueNotReady);
        }
        Ok(self.channel.reserve()?)
    }

    /// Descriptor bytes of slot `index`.
    pub fn descriptor(&self, index: usize) -> Option<&[u8]> {
        let handle = self.channel.dtr(index)?;
        self.mempool.item_data(handle)
    }

    pub fn descriptor_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let handle = self.channel.dtr(index)?;
        self.mempool.item_data_mut(handle)
    }

    /// Hand slot `index` to the device and ring the doorbell.
    pub fn post(&mut self, index: usize) -> Result<()> {
        let handle = self
            .channel
            .dtr(index)
            .ok_or(HalError::QueueNotReady)?;
        let dma_addr = self
            .mempool
            .item_dma_addr(handle)
            .ok_or(HalError::QueueNotReady)?;
        self.channel.post(index)?;
        self.doorbell.ring(index, dma_addr);
        log::trace!(target: TARGET, "posted slot {} at {:#x}", index, dma_addr);
        Ok(())
    }

    /// Take the next completed descriptor, if the device finished one.
    pub fn poll(&mut self) -> Option<Descriptor<ItemHandle>> {
        let desc = self.channel.try_complete()?;
        self.channel.complete();
        Some(desc)
    }

    /// Return slot `index` to the ring once its result is consumed.
    pub fn free(&mut self, index: usize) -> Result<()> {
        Ok(self.channel.free_slot(index)?)
    }

    /// Undo the latest reservation. See [`Channel::restore`].
    pub fn restore(&mut self, desc: Descriptor<ItemHandle>) -> bool {
        match desc.dtr {
            Some(handle) => self.channel.restore(handle),
            None => false,
        }
    }

    /// Rewind the ring, keeping descriptor memory.
    pub fn reset(&mut self) {
        self.channel.reset();
    }

    pub fn stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn channel(&self) -> &Channel<ItemHandle> {
        &self.channel
    }

    pub fn mempool(&self) -> &MemPool<D> {
        &self.mempool
    }

    pub fn doorbell(&self) -> &B {
        &self.doorbell
    }

    /// Bind every populated item not yet on a slot.
    fn bind(&mut self) -> Result<()> {
        while self.bound < self.channel.length() {
            let Some(handle) = self.mempool.item(self.bound) else {
                break;
            };
            self.channel.set_dtr(self.bound, handle)?;
            self.bound += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use dma_pool::{BlockPoolConfig, HeapDma};
    use vxge_channel::DtrState;

    #[derive(Default)]
    struct Bell(Vec<(usize, u64)>);

    impl Doorbell for Bell {
        fn ring(&mut self, index: usize, dma_addr: u64) {
            self.0.push((index, dma_addr));
        }
    }

    fn pool() -> (Arc<HeapDma>, Arc<BlockPool<Arc<HeapDma>>>) {
        let dma = Arc::new(HeapDma::new());
        let pool = BlockPool::create(dma.clone(), BlockPoolConfig::new(4, 2, 0, 16)).unwrap();
        (dma, Arc::new(pool))
    }

    #[test]
    fn test_post_rings_doorbell_with_descriptor_address() {
        let (_dma, pool) = pool();
        let mut q = DescQueue::create(pool, ChannelConfig::fifo(8), Bell::default()).unwrap();
        assert!(q.is_ready());

        let desc = q.reserve().unwrap();
        q.descriptor_mut(desc.index).unwrap()[0] = 0x42;
        q.post(desc.index).unwrap();

        let handle = desc.dtr.unwrap();
        let expected = q.mempool().item_dma_addr(handle).unwrap();
        assert_eq!(q.doorbell().0, [(0, expected)]);
        assert_eq!(q.descriptor(0).unwrap()[0], 0x42);

        let done = q.poll().unwrap();
        assert_eq!(done.index, 0);
        assert!(q.poll().is_none());
        q.free(0).unwrap();
        assert_eq!(q.channel().state(0), Some(DtrState::Free));
    }

    #[test]
    fn test_partial_queue_refuses_until_replenished() {
        let (dma, pool) = pool();
        // 64 descriptors per block, four blocks for the whole ring.
        let config = ChannelConfig::fifo(256).with_initial(1);
        let mut q = DescQueue::create(pool, config, Bell::default()).unwrap();
        assert_eq!(q.bound(), 64);
        assert!(!q.is_ready());
        assert_eq!(q.reserve().unwrap_err(), HalError::QueueNotReady);

        dma.fail_next_allocs(1);
        // Pool still holds blocks, so the platform is not asked.
        assert_eq!(q.replenish().unwrap(), 192);
        assert!(q.is_ready());
        assert!(q.reserve().is_ok());
    }

    #[test]
    fn test_replenish_failure_is_transient() {
        let (dma, pool) = pool();
        let held: Vec<_> = (0..3).map(|_| pool.malloc(dma_pool::PAGE_SIZE).unwrap()).collect();
        let config = ChannelConfig::fifo(256).with_initial(1);
        let mut q = DescQueue::create(pool.clone(), config, Bell::default()).unwrap();
        assert_eq!(pool.pool_size(), 0);

        dma.fail_next_allocs(1);
        let err = q.replenish().unwrap_err();
        assert!(err.is_transient());
        assert!(!q.is_ready());

        assert_eq!(q.replenish().unwrap(), 192);
        for block in held {
            pool.free(block);
        }
    }

    #[test]
    fn test_restore_aborts_reservation() {
        let (_dma, pool) = pool();
        let mut q = DescQueue::create(pool, ChannelConfig::ring(4), Bell::default()).unwrap();
        let first = q.reserve().unwrap();
        let second = q.reserve().unwrap();
        // Out of order: only the latest reservation can be restored.
        assert!(!q.restore(first));
        assert!(q.restore(second));
        assert_eq!(q.reserve().unwrap().index, 1);
    }
}
