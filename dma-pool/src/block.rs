//! DMA blocks and their pool metadata entries.

use crate::ops::{AccHandle, DmaHandle, DmaMemory};

/// Device-visible description of a block.
///
/// Copyable view handed to item hooks and descriptor setup code that need
/// the bus address without borrowing the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaObject {
    /// Bus address of the first byte.
    pub dma_addr: u64,
    /// Platform mapping handle.
    pub handle: DmaHandle,
    /// Platform access handle.
    pub acc_handle: AccHandle,
    /// Length in bytes.
    pub len: usize,
}

/// One mapped DMA block.
#[derive(Debug)]
pub struct DmaBlock {
    mem: DmaMemory,
    dma_addr: u64,
}

impl DmaBlock {
    /// Pair platform memory with the bus address it was mapped at.
    pub fn new(mem: DmaMemory, dma_addr: u64) -> Self {
        Self { mem, dma_addr }
    }

    /// Block size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Bus address.
    #[inline]
    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    /// Host address.
    #[inline]
    pub fn vaddr(&self) -> usize {
        self.mem.vaddr()
    }

    #[inline]
    pub fn handle(&self) -> DmaHandle {
        self.mem.handle()
    }

    #[inline]
    pub fn acc_handle(&self) -> AccHandle {
        self.mem.acc_handle()
    }

    /// Copyable device-side description.
    pub fn dma_object(&self) -> DmaObject {
        DmaObject {
            dma_addr: self.dma_addr,
            handle: self.mem.handle(),
            acc_handle: self.mem.acc_handle(),
            len: self.mem.len(),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.mem.as_slice()
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mem.as_mut_slice()
    }

    /// Fill with zeroes.
    pub fn zero(&mut self) {
        self.mem.zero();
    }

    /// Split into platform memory and bus address for unmap/free.
    pub fn into_parts(self) -> (DmaMemory, u64) {
        (self.mem, self.dma_addr)
    }
}

/// Pool metadata for one block.
///
/// While the block sits in the pool the entry carries it on the free-block
/// list. An entry without a block is a spare: it waits on the spare list
/// until a returning block needs one, so the free path never allocates
/// metadata.
#[derive(Debug, Default)]
pub struct BlockEntry {
    block: Option<DmaBlock>,
}

impl BlockEntry {
    /// A spare entry.
    pub const fn new() -> Self {
        Self { block: None }
    }

    /// An entry carrying `block`.
    pub fn with_block(block: DmaBlock) -> Self {
        Self { block: Some(block) }
    }

    /// True if the entry carries no block.
    #[inline]
    pub fn is_spare(&self) -> bool {
        self.block.is_none()
    }

    pub fn block(&self) -> Option<&DmaBlock> {
        self.block.as_ref()
    }

    pub fn block_mut(&mut self) -> Option<&mut DmaBlock> {
        self.block.as_mut()
    }

    /// Detach the block, leaving a spare entry behind.
    pub fn take_block(&mut self) -> Option<DmaBlock> {
        self.block.take()
    }

    /// Attach `block`, returning whatever the entry carried before.
    pub fn set_block(&mut self, block: DmaBlock) -> Option<DmaBlock> {
        self.block.replace(block)
    }
}
