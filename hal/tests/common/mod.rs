//! Shared fixtures for the HAL integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use dma_pool::{BlockPool, BlockPoolConfig, HeapDma};
use vxge_hal::{Doorbell, ItemHooks, MempoolError, MempoolItem};

pub type TestPool = BlockPool<Arc<HeapDma>>;

/// Host DMA backend that holds asynchronous allocations back.
pub fn deferred_dma() -> Arc<HeapDma> {
    let dma = Arc::new(HeapDma::new());
    dma.set_deferred(true);
    dma
}

pub fn blockpool(config: BlockPoolConfig) -> (Arc<HeapDma>, Arc<TestPool>) {
    let dma = deferred_dma();
    let pool = BlockPool::create(dma.clone(), config).expect("block pool");
    (dma, Arc::new(pool))
}

/// Item hooks that record every call and can fail on request.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub allocated: Vec<usize>,
    pub freed: Vec<usize>,
    pub last_flags: Vec<usize>,
    pub fail_at: Option<usize>,
}

impl ItemHooks for RecordingHooks {
    fn item_alloc(&mut self, item: MempoolItem<'_>) -> Result<(), MempoolError> {
        if self.fail_at == Some(item.index) {
            return Err(MempoolError::OutOfMemory);
        }
        if item.is_last {
            self.last_flags.push(item.index);
        }
        self.allocated.push(item.index);
        Ok(())
    }

    fn item_free(&mut self, item: MempoolItem<'_>) {
        self.freed.push(item.index);
    }
}

/// Doorbell that remembers what it was rung with.
#[derive(Debug, Default)]
pub struct RecordingBell {
    pub rings: Vec<(usize, u64)>,
}

impl Doorbell for RecordingBell {
    fn ring(&mut self, index: usize, dma_addr: u64) {
        self.rings.push((index, dma_addr));
    }
}
