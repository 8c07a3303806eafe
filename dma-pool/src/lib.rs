//! Block-oriented DMA memory pool for the vxge HAL core.
//!
//! This crate keeps a warm cache of fixed-size, device-mapped DMA blocks
//! so hot-path allocation rarely waits on the platform's (slow, possibly
//! asynchronous) allocate-and-map path.
//!
//! # Layers
//!
//! - [`DmaOps`]: capability interface to the platform (allocate, map,
//!   unmap, free, asynchronous allocate).
//! - [`HeapDma`]: host-memory implementation of [`DmaOps`] with identity
//!   mapping. Used by tests and by hosted builds.
//! - [`BlockPool`]: the block cache with `{initial, increment, min, max}`
//!   watermarks.
//!
//! # Usage
//!
//! ```ignore
//! use dma_pool::{BlockPool, BlockPoolConfig, HeapDma};
//!
//! let pool = BlockPool::create(HeapDma::new(), BlockPoolConfig::default())?;
//! let block = pool.malloc(pool.block_size())?;
//! // ... hand `block.dma_addr()` to the device ...
//! pool.free(block);
//!
//! // From deferred-work context: fold in async replenishment results.
//! pool.poll_completions();
//! ```

#![no_std]

extern crate alloc;

pub mod block;
pub mod blockpool;
pub mod error;
pub mod heap;
pub mod ops;

pub use block::{BlockEntry, DmaBlock, DmaObject};
pub use blockpool::{BlockPool, BlockPoolConfig, BlockPoolStats};
pub use error::{DmaError, Result};
pub use heap::{HeapDma, HeapDmaStats};
pub use ops::{AccHandle, AllocCompletion, DmaDirection, DmaFlags, DmaHandle, DmaMemory, DmaOps};

/// Page size (4KB). Default size of a pool block.
pub const PAGE_SIZE: usize = 4096;
