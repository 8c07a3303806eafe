//! HAL error types.

use dma_pool::DmaError;
use vxge_channel::ChannelError;

/// Item mempool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    /// Host memory, DMA memory or block capacity exhausted.
    #[error("mempool out of memory")]
    OutOfMemory,
    /// Sizing violates a static invariant.
    #[error("invalid mempool configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<DmaError> for MempoolError {
    fn from(e: DmaError) -> Self {
        match e {
            DmaError::InvalidConfig(msg) => MempoolError::InvalidConfig(msg),
            _ => MempoolError::OutOfMemory,
        }
    }
}

/// Errors surfaced by the HAL core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    #[error(transparent)]
    Dma(#[from] DmaError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Not every slot of the queue is bound to a descriptor yet.
    #[error("queue not ready")]
    QueueNotReady,
    #[error("no such queue: {0}")]
    UnknownQueue(usize),
    #[error("queue table full")]
    TooManyQueues,
}

impl HalError {
    /// True for memory shortages that may clear once resources return.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HalError::Dma(DmaError::OutOfMemory)
                | HalError::Channel(ChannelError::OutOfMemory)
                | HalError::Mempool(MempoolError::OutOfMemory)
        )
    }
}

/// Result type for HAL operations.
pub type Result<T> = core::result::Result<T, HalError>;
