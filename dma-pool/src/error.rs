//! DMA pool error types.

/// DMA pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    /// The platform could not satisfy an allocation.
    #[error("out of DMA memory")]
    OutOfMemory,
    /// Requested a zero-byte allocation.
    #[error("zero-sized DMA allocation")]
    ZeroSize,
    /// The platform could not make a block visible to the device.
    #[error("DMA mapping failed")]
    MapFailed,
    /// Pool configuration violates a static invariant.
    #[error("invalid block pool configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type for DMA operations.
pub type Result<T> = core::result::Result<T, DmaError>;
