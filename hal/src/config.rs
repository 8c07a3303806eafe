//! HAL configuration.
//!
//! Plain structs with `Default` and named presets. Every constructor that
//! takes one calls `validate()` first.

use dma_pool::BlockPoolConfig;
use vxge_channel::ChannelType;

use crate::error::{HalError, MempoolError};

/// Item mempool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolConfig {
    /// Bytes per item. Items never straddle a block.
    pub item_size: usize,
    /// Bytes of zeroed host-private storage per item.
    pub items_priv_size: usize,
    /// Items populated at creation.
    pub items_initial: usize,
    /// Upper bound on items.
    pub items_max: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            item_size: 64,
            items_priv_size: 0,
            items_initial: 128,
            items_max: 1024,
        }
    }
}

impl MempoolConfig {
    pub const fn new(item_size: usize, items_initial: usize, items_max: usize) -> Self {
        Self {
            item_size,
            items_priv_size: 0,
            items_initial,
            items_max,
        }
    }

    /// Same sizing with `size` bytes of private storage per item.
    pub const fn with_priv_size(mut self, size: usize) -> Self {
        self.items_priv_size = size;
        self
    }

    /// Items that fit in one block of `block_size` bytes. The tail of a
    /// block that `item_size` does not divide is left unused.
    pub const fn items_per_block(&self, block_size: usize) -> usize {
        if self.item_size == 0 {
            0
        } else {
            block_size / self.item_size
        }
    }

    /// Check against the block size of the pool that will back it.
    pub fn validate(&self, block_size: usize) -> Result<(), MempoolError> {
        if self.item_size == 0 {
            return Err(MempoolError::InvalidConfig("item_size must be non-zero"));
        }
        if block_size < self.item_size {
            return Err(MempoolError::InvalidConfig("item_size exceeds block_size"));
        }
        if self.items_max == 0 {
            return Err(MempoolError::InvalidConfig("items_max must be non-zero"));
        }
        if self.items_initial > self.items_max {
            return Err(MempoolError::InvalidConfig("items_initial exceeds items_max"));
        }
        Ok(())
    }
}

/// Descriptor queue shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel_type: ChannelType,
    /// Ring slots.
    pub length: usize,
    /// Bytes per hardware descriptor.
    pub desc_size: usize,
    /// Caller-private bytes per slot.
    pub per_item_space: usize,
    /// Descriptors bound at open; the rest are bound by replenishment.
    pub initial_descriptors: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::ring(256)
    }
}

impl ChannelConfig {
    /// Receive ring with every descriptor bound at open.
    pub const fn ring(length: usize) -> Self {
        Self {
            channel_type: ChannelType::Ring,
            length,
            desc_size: 32,
            per_item_space: 0,
            initial_descriptors: length,
        }
    }

    /// Transmit fifo with every descriptor bound at open.
    pub const fn fifo(length: usize) -> Self {
        Self {
            channel_type: ChannelType::Fifo,
            length,
            desc_size: 64,
            per_item_space: 0,
            initial_descriptors: length,
        }
    }

    /// Bind only `count` descriptors at open.
    pub const fn with_initial(mut self, count: usize) -> Self {
        self.initial_descriptors = count;
        self
    }

    pub fn validate(&self) -> Result<(), HalError> {
        if self.length == 0 {
            return Err(HalError::InvalidConfig("channel length must be non-zero"));
        }
        if self.desc_size == 0 {
            return Err(HalError::InvalidConfig("desc_size must be non-zero"));
        }
        if self.initial_descriptors > self.length {
            return Err(HalError::InvalidConfig("initial_descriptors exceeds length"));
        }
        Ok(())
    }
}

/// Device session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalConfig {
    pub blockpool: BlockPoolConfig,
    /// Descriptor queues the session can hold open at once.
    pub max_queues: usize,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            blockpool: BlockPoolConfig::default(),
            max_queues: 16,
        }
    }
}

impl HalConfig {
    /// Small pool and a handful of queues.
    pub const fn minimal() -> Self {
        Self {
            blockpool: BlockPoolConfig::minimal(),
            max_queues: 4,
        }
    }

    pub fn validate(&self) -> Result<(), HalError> {
        self.blockpool.validate()?;
        if self.max_queues == 0 {
            return Err(HalError::InvalidConfig("max_queues must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mempool_config() {
        let config = MempoolConfig::new(64, 100, 1000);
        assert_eq!(config.items_per_block(4096), 64);
        assert!(config.validate(4096).is_ok());
        assert_eq!(
            config.validate(32),
            Err(MempoolError::InvalidConfig("item_size exceeds block_size"))
        );
        assert!(MempoolConfig::new(64, 10, 5).validate(4096).is_err());
        assert!(MempoolConfig::new(0, 0, 5).validate(4096).is_err());
        // Remainder bytes are wasted.
        assert_eq!(MempoolConfig::new(100, 1, 1).items_per_block(4096), 40);
    }

    #[test]
    fn test_channel_config() {
        assert!(ChannelConfig::default().validate().is_ok());
        assert!(ChannelConfig::fifo(0).validate().is_err());
        assert!(ChannelConfig::ring(8).with_initial(9).validate().is_err());
        assert_eq!(ChannelConfig::fifo(8).channel_type, ChannelType::Fifo);
    }

    #[test]
    fn test_hal_config() {
        assert!(HalConfig::default().validate().is_ok());
        assert!(HalConfig::minimal().validate().is_ok());
        let mut config = HalConfig::minimal();
        config.max_queues = 0;
        assert!(config.validate().is_err());
    }
}
