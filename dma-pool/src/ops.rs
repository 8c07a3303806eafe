//! Platform DMA capability interface.
//!
//! The pool never touches hardware itself. Everything that depends on
//! the platform (physically contiguous memory, IOMMU mappings, deferred
//! allocation) goes through [`DmaOps`].

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::Result;

bitflags! {
    /// Allocation and mapping attributes passed through to the platform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaFlags: u32 {
        /// Coherent memory; no explicit sync needed.
        const CONSISTENT = 1 << 0;
        /// Streaming memory; caller syncs around device access.
        const STREAMING = 1 << 1;
        /// Start address aligned to a cache line.
        const CACHELINE_ALIGNED = 1 << 2;
    }
}

/// Direction of device access for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads, CPU writes.
    ToDevice,
    /// Device writes, CPU reads.
    FromDevice,
    /// Both.
    Bidirectional,
}

/// Platform mapping handle for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaHandle(pub u64);

/// Platform access handle for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccHandle(pub u64);

/// Memory handed out by [`DmaOps::alloc`].
///
/// Owns the host buffer. Device visibility comes from a separate
/// [`DmaOps::map`] call.
pub struct DmaMemory {
    buf: Box<[u8]>,
    handle: DmaHandle,
    acc_handle: AccHandle,
}

impl DmaMemory {
    /// Wrap a platform allocation.
    pub fn new(buf: Box<[u8]>, handle: DmaHandle, acc_handle: AccHandle) -> Self {
        Self {
            buf,
            handle,
            acc_handle,
        }
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True for a zero-byte allocation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Host (virtual) address of the buffer.
    #[inline]
    pub fn vaddr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    #[inline]
    pub fn handle(&self) -> DmaHandle {
        self.handle
    }

    #[inline]
    pub fn acc_handle(&self) -> AccHandle {
        self.acc_handle
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Fill with zeroes.
    pub fn zero(&mut self) {
        self.buf.fill(0);
    }
}

impl core::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("vaddr", &format_args!("{:#x}", self.vaddr()))
            .field("len", &self.len())
            .field("handle", &self.handle)
            .field("acc_handle", &self.acc_handle)
            .finish()
    }
}

#[derive(Default)]
struct CompletionState {
    closed: bool,
    results: VecDeque<Option<DmaMemory>>,
}

/// Queue asynchronous allocation results are delivered into.
///
/// The owning pool closes it on teardown; results that arrive later are
/// refused and handed back to the sender.
#[derive(Clone, Default)]
pub(crate) struct CompletionQueue(Arc<Mutex<CompletionState>>);

impl CompletionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `mem`. Returns it back if the queue is closed.
    fn push(&self, mem: Option<DmaMemory>) -> Option<DmaMemory> {
        let mut state = self.0.lock();
        if state.closed {
            return mem;
        }
        state.results.push_back(mem);
        None
    }

    pub(crate) fn pop(&self) -> Option<Option<DmaMemory>> {
        self.0.lock().results.pop_front()
    }

    /// Refuse further results and return the undelivered ones.
    pub(crate) fn close(&self) -> VecDeque<Option<DmaMemory>> {
        let mut state = self.0.lock();
        state.closed = true;
        core::mem::take(&mut state.results)
    }
}

/// One-shot completion for [`DmaOps::alloc_async`].
///
/// The platform calls [`complete`](Self::complete) exactly once, from any
/// context, with the allocated memory or `None` on failure. The result is
/// queued for the pool; it is folded into pool state the next time the
/// pool polls its completions.
///
/// Dropping an uncompleted `AllocCompletion` reports a failure, so the
/// pool's outstanding-request count never leaks.
pub struct AllocCompletion {
    queue: Option<CompletionQueue>,
    size: usize,
}

impl AllocCompletion {
    pub(crate) fn new(queue: CompletionQueue, size: usize) -> Self {
        Self {
            queue: Some(queue),
            size,
        }
    }

    /// Requested allocation size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Deliver the allocation result.
    ///
    /// If the pool is already gone the memory is handed back and the
    /// caller must [`free`](DmaOps::free) it.
    #[must_use = "memory refused by a destroyed pool must be freed"]
    pub fn complete(mut self, mem: Option<DmaMemory>) -> Option<DmaMemory> {
        match self.queue.take() {
            Some(queue) => queue.push(mem),
            None => mem,
        }
    }
}

impl Drop for AllocCompletion {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            let _ = queue.push(None);
        }
    }
}

/// Platform DMA services.
pub trait DmaOps {
    /// Allocate `size` bytes of memory suitable for device DMA.
    fn alloc(&self, size: usize, flags: DmaFlags) -> Result<DmaMemory>;

    /// Make `mem` visible to the device. Returns the bus address.
    fn map(&self, mem: &DmaMemory, direction: DmaDirection, flags: DmaFlags) -> Result<u64>;

    /// Reverse of [`map`](Self::map).
    fn unmap(&self, mem: &DmaMemory, dma_addr: u64, direction: DmaDirection);

    /// Release memory from [`alloc`](Self::alloc).
    fn free(&self, mem: DmaMemory);

    /// Non-blocking allocation. The result arrives through `done`.
    ///
    /// The default completes synchronously using [`alloc`](Self::alloc).
    fn alloc_async(&self, size: usize, flags: DmaFlags, done: AllocCompletion) {
        if let Some(mem) = done.complete(self.alloc(size, flags).ok()) {
            self.free(mem);
        }
    }
}

impl<D: DmaOps + ?Sized> DmaOps for Arc<D> {
    fn alloc(&self, size: usize, flags: DmaFlags) -> Result<DmaMemory> {
        (**self).alloc(size, flags)
    }

    fn map(&self, mem: &DmaMemory, direction: DmaDirection, flags: DmaFlags) -> Result<u64> {
        (**self).map(mem, direction, flags)
    }

    fn unmap(&self, mem: &DmaMemory, dma_addr: u64, direction: DmaDirection) {
        (**self).unmap(mem, dma_addr, direction)
    }

    fn free(&self, mem: DmaMemory) {
        (**self).free(mem)
    }

    fn alloc_async(&self, size: usize, flags: DmaFlags, done: AllocCompletion) {
        (**self).alloc_async(size, flags, done)
    }
}
