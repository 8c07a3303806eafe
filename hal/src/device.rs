//! Device session.
//!
//! [`HalDevice`] owns everything the HAL core needs for one open device:
//! the block pool, the descriptor queues and the pending list of queues
//! waiting for descriptor memory. Its lifetime is the device session.

use alloc::sync::Arc;
use alloc::vec::Vec;

use dma_pool::{BlockPool, DmaOps};
use vxge_channel::{Channel, ChannelError, ChannelType, PendingList};

use crate::config::{ChannelConfig, HalConfig, MempoolConfig};
use crate::error::{HalError, Result};
use crate::mempool::{ItemHooks, MemPool};
use crate::queue::{DescQueue, Doorbell};

const TARGET: &str = "vxge::device";

/// Index of a queue within its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);

/// What one [`HalDevice::poll`] pass achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevicePollStats {
    /// Blocks delivered by asynchronous replenishment.
    pub blocks_added: usize,
    /// Pending queues that became ready.
    pub queues_replenished: usize,
}

/// One open device.
pub struct HalDevice<D: DmaOps, B: Doorbell> {
    config: HalConfig,
    // Dropped before the block pool: queues return their blocks first.
    queues: Vec<Option<DescQueue<D, B>>>,
    pending: PendingList<QueueId>,
    blockpool: Arc<BlockPool<D>>,
}

impl<D: DmaOps, B: Doorbell> HalDevice<D, B> {
    /// Open a session over the platform DMA services `dma`.
    pub fn open(dma: D, config: HalConfig) -> Result<Self> {
        config.validate()?;
        let blockpool = Arc::new(BlockPool::create(dma, config.blockpool)?);

        let mut queues = Vec::new();
        queues
            .try_reserve_exact(config.max_queues)
            .map_err(|_| HalError::Channel(ChannelError::OutOfMemory))?;
        queues.resize_with(config.max_queues, || None);

        log::info!(
            target: TARGET,
            "device open: block_size={} blocks={} max_queues={}",
            blockpool.block_size(),
            blockpool.pool_size(),
            config.max_queues
        );
        Ok(Self {
            config,
            queues,
            pending: PendingList::new(),
            blockpool,
        })
    }

    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    pub fn blockpool(&self) -> &Arc<BlockPool<D>> {
        &self.blockpool
    }

    /// Item pool over this device's blocks.
    pub fn mempool_create<H: ItemHooks>(&self, config: MempoolConfig, hooks: H) -> Result<MemPool<D, H>> {
        Ok(MemPool::create(self.blockpool.clone(), config, hooks)?)
    }

    /// Bare channel, for callers that manage descriptor memory themselves.
    pub fn channel_allocate<H: Copy + PartialEq, U>(
        &self,
        ty: ChannelType,
        length: usize,
        per_item_space: usize,
        userdata: U,
    ) -> Result<Channel<H, U>> {
        Ok(Channel::allocate(ty, length, per_item_space, userdata)?)
    }

    /// Open a descriptor queue.
    ///
    /// A queue that opened with only part of its descriptors is
    /// replenished at once; if memory is short it goes on the pending
    /// list and becomes ready on a later [`poll`](Self::poll).
    pub fn queue_open(&mut self, config: ChannelConfig, doorbell: B) -> Result<QueueId> {
        let index = self
            .queues
            .iter()
            .position(Option::is_none)
            .ok_or(HalError::TooManyQueues)?;
        let id = QueueId(index);

        let mut queue = DescQueue::create(self.blockpool.clone(), config, doorbell)?;
        queue.initialize(index);
        let ready = queue.is_ready();
        self.queues[index] = Some(queue);

        if !ready {
            let queues = &mut self.queues;
            self.pending.insert(id, |&id| retry_replenish(&mut queues[..], id));
        }
        log::debug!(target: TARGET, "queue {} open", index);
        Ok(id)
    }

    pub fn queue(&self, id: QueueId) -> Option<&DescQueue<D, B>> {
        self.queues.get(id.0).and_then(Option::as_ref)
    }

    pub fn queue_mut(&mut self, id: QueueId) -> Option<&mut DescQueue<D, B>> {
        self.queues.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Close a queue and release its descriptor memory.
    pub fn queue_close(&mut self, id: QueueId) -> Result<()> {
        let mut queue = self
            .queues
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(HalError::UnknownQueue(id.0))?;
        queue.terminate();
        log::debug!(target: TARGET, "queue {} closed", id.0);
        Ok(())
    }

    /// Queues waiting for descriptor memory.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fold in block pool completions, then retry pending queues.
    pub fn poll(&mut self) -> DevicePollStats {
        let blocks_added = self.blockpool.poll_completions();
        let queues = &mut self.queues;
        let queues_replenished = self.pending.process(|&id| retry_replenish(&mut queues[..], id));
        DevicePollStats {
            blocks_added,
            queues_replenished,
        }
    }

    /// Tear the session down: pending list, queues, then the block pool.
    pub fn close(self) {
        drop(self);
    }
}

impl<D: DmaOps, B: Doorbell> Drop for HalDevice<D, B> {
    fn drop(&mut self) {
        self.pending.destroy();
        for queue in self.queues.iter_mut().filter_map(Option::take) {
            drop(queue);
        }
        log::info!(target: TARGET, "device closed");
    }
}

fn retry_replenish<D: DmaOps, B: Doorbell>(
    queues: &mut [Option<DescQueue<D, B>>],
    id: QueueId,
) -> core::result::Result<(), ChannelError> {
    let length = queues.len();
    let queue = queues
        .get_mut(id.0)
        .and_then(Option::as_mut)
        .ok_or(ChannelError::InvalidIndex { index: id.0, length })?;
    match queue.replenish() {
        Ok(_) => Ok(()),
        Err(e) if e.is_transient() => Err(ChannelError::OutOfMemory),
        Err(e) => {
            log::warn!(target: TARGET, "queue {} replenish failed: {}", id.0, e);
            Err(ChannelError::RetryFailed)
        }
    }
}
