//! Host-memory DMA backend.
//!
//! Identity mapping: the bus address of a block is its host address. No
//! IOMMU, no cache maintenance. Suits hosted builds and tests; a real
//! driver supplies its own [`DmaOps`].
//!
//! Faults can be injected per operation, and asynchronous allocations can
//! be held back until [`HeapDma::complete_deferred`] runs, which lets tests
//! drive the pool's replenishment path deterministically.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{DmaError, Result};
use crate::ops::{AccHandle, AllocCompletion, DmaDirection, DmaFlags, DmaHandle, DmaMemory, DmaOps};

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapDmaStats {
    pub allocs: u64,
    pub frees: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub async_requests: u64,
    pub failed_allocs: u64,
}

impl HeapDmaStats {
    /// Allocations not yet freed.
    pub fn live(&self) -> u64 {
        self.allocs - self.frees
    }
}

struct Deferred {
    size: usize,
    flags: DmaFlags,
    done: AllocCompletion,
}

#[derive(Default)]
struct HeapState {
    next_handle: u64,
    fail_allocs: usize,
    fail_maps: usize,
    fail_async: usize,
    defer_async: bool,
    deferred: VecDeque<Deferred>,
    stats: HeapDmaStats,
}

/// [`DmaOps`] over the global heap.
pub struct HeapDma {
    state: Mutex<HeapState>,
}

impl HeapDma {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
        }
    }

    /// Fail the next `count` synchronous allocations.
    pub fn fail_next_allocs(&self, count: usize) {
        self.state.lock().fail_allocs = count;
    }

    /// Fail the next `count` mappings.
    pub fn fail_next_maps(&self, count: usize) {
        self.state.lock().fail_maps = count;
    }

    /// Fail the next `count` asynchronous allocations.
    pub fn fail_next_async(&self, count: usize) {
        self.state.lock().fail_async = count;
    }

    /// Hold asynchronous allocations until [`complete_deferred`](Self::complete_deferred).
    pub fn set_deferred(&self, deferred: bool) {
        self.state.lock().defer_async = deferred;
    }

    /// Number of asynchronous allocations waiting to complete.
    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Complete every held-back asynchronous allocation. Returns how many
    /// were completed.
    pub fn complete_deferred(&self) -> usize {
        let mut completed = 0;
        loop {
            let Some(request) = self.state.lock().deferred.pop_front() else {
                break;
            };
            self.finish_async(request);
            completed += 1;
        }
        completed
    }

    pub fn stats(&self) -> HeapDmaStats {
        self.state.lock().stats
    }

    fn finish_async(&self, request: Deferred) {
        let fail = {
            let mut state = self.state.lock();
            if state.fail_async > 0 {
                state.fail_async -= 1;
                true
            } else {
                false
            }
        };
        let result = if fail {
            None
        } else {
            self.alloc(request.size, request.flags).ok()
        };
        if let Some(mem) = request.done.complete(result) {
            self.free(mem);
        }
    }
}

impl Default for HeapDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaOps for HeapDma {
    fn alloc(&self, size: usize, _flags: DmaFlags) -> Result<DmaMemory> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        let handle = {
            let mut state = self.state.lock();
            if state.fail_allocs > 0 {
                state.fail_allocs -= 1;
                state.stats.failed_allocs += 1;
                return Err(DmaError::OutOfMemory);
            }
            state.next_handle += 1;
            state.next_handle
        };

        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            self.state.lock().stats.failed_allocs += 1;
            return Err(DmaError::OutOfMemory);
        }
        buf.resize(size, 0u8);

        self.state.lock().stats.allocs += 1;
        Ok(DmaMemory::new(
            buf.into_boxed_slice(),
            DmaHandle(handle),
            AccHandle(handle),
        ))
    }

    fn map(&self, mem: &DmaMemory, _direction: DmaDirection, _flags: DmaFlags) -> Result<u64> {
        let mut state = self.state.lock();
        if state.fail_maps > 0 {
            state.fail_maps -= 1;
            return Err(DmaError::MapFailed);
        }
        state.stats.maps += 1;
        // Identity mapping: bus address == host address
        Ok(mem.vaddr() as u64)
    }

    fn unmap(&self, _mem: &DmaMemory, _dma_addr: u64, _direction: DmaDirection) {
        self.state.lock().stats.unmaps += 1;
    }

    fn free(&self, mem: DmaMemory) {
        self.state.lock().stats.frees += 1;
        drop(mem);
    }

    fn alloc_async(&self, size: usize, flags: DmaFlags, done: AllocCompletion) {
        let request = Deferred { size, flags, done };
        {
            let mut state = self.state.lock();
            state.stats.async_requests += 1;
            if state.defer_async {
                state.deferred.push_back(request);
                return;
            }
        }
        self.finish_async(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mapping() {
        let dma = HeapDma::new();
        let mem = dma.alloc(256, DmaFlags::CONSISTENT).unwrap();
        let addr = dma.map(&mem, DmaDirection::Bidirectional, DmaFlags::CONSISTENT).unwrap();
        assert_eq!(addr, mem.vaddr() as u64);
        assert!(mem.as_slice().iter().all(|&b| b == 0));
        dma.unmap(&mem, addr, DmaDirection::Bidirectional);
        dma.free(mem);

        let stats = dma.stats();
        assert_eq!(stats.allocs, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.maps, 1);
        assert_eq!(stats.unmaps, 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        let dma = HeapDma::new();
        assert_eq!(dma.alloc(0, DmaFlags::empty()).unwrap_err(), DmaError::ZeroSize);
    }

    #[test]
    fn test_fault_injection() {
        let dma = HeapDma::new();
        dma.fail_next_allocs(1);
        assert_eq!(dma.alloc(64, DmaFlags::empty()).unwrap_err(), DmaError::OutOfMemory);
        let mem = dma.alloc(64, DmaFlags::empty()).unwrap();

        dma.fail_next_maps(1);
        assert_eq!(
            dma.map(&mem, DmaDirection::ToDevice, DmaFlags::empty()).unwrap_err(),
            DmaError::MapFailed
        );
        assert!(dma.map(&mem, DmaDirection::ToDevice, DmaFlags::empty()).is_ok());
        dma.free(mem);
        assert_eq!(dma.stats().failed_allocs, 1);
    }

    #[test]
    fn test_handles_are_unique() {
        let dma = HeapDma::new();
        let a = dma.alloc(8, DmaFlags::empty()).unwrap();
        let b = dma.alloc(8, DmaFlags::empty()).unwrap();
        assert_ne!(a.handle(), b.handle());
        dma.free(a);
        dma.free(b);
    }
}
