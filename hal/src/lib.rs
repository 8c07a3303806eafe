//! vxge HAL core.
//!
//! Ties the block pool, the item mempool and descriptor channels into a
//! device session:
//!
//! ```text
//!   HalDevice ── BlockPool ── DmaOps (platform)
//!       │            ▲
//!       │        MemPool (items carved out of blocks)
//!       │            ▲
//!       └──────── DescQueue ── Channel (slot lifecycle)
//!                    │
//!                 Doorbell
//! ```
//!
//! Nothing here is global. A [`HalDevice`] owns everything for the
//! lifetime of one device session.

#![no_std]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod logger;
pub mod mempool;
pub mod queue;

pub use config::{ChannelConfig, HalConfig, MempoolConfig};
pub use device::{DevicePollStats, HalDevice, QueueId};
pub use error::{HalError, MempoolError, Result};
pub use mempool::{ItemHandle, ItemHooks, MemPool, MempoolItem};
pub use queue::{DescQueue, Doorbell};

pub use dma_pool::{BlockPool, BlockPoolConfig, DmaOps, HeapDma};
pub use vxge_channel::{Channel, ChannelError, ChannelType, Descriptor, DtrState, PendingList};
