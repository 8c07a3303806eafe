//! Channel error types.

/// Channel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No free slot at the reservation point. Backpressure, not a fault.
    #[error("out of descriptors")]
    OutOfDescriptors,
    /// Host or DMA memory exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// A channel needs at least one slot.
    #[error("invalid channel length {0}")]
    InvalidLength(usize),
    /// Slot index past the end of the ring.
    #[error("slot index {index} out of range for length {length}")]
    InvalidIndex { index: usize, length: usize },
    /// A deferred operation failed for a reason retrying will not fix.
    #[error("deferred operation failed")]
    RetryFailed,
}

impl ChannelError {
    /// True for shortages that may clear once resources are returned.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::OutOfMemory)
    }
}

/// Result type for channel operations.
pub type Result<T> = core::result::Result<T, ChannelError>;
