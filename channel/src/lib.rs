//! Descriptor channels.
//!
//! A [`Channel`] is a fixed-length ring of descriptor slots. Each slot
//! moves through a four-state lifecycle:
//!
//! ```text
//!     FREE ──reserve()──> RESERVED ──post()──> POSTED
//!       ▲                     │                   │
//!       └──restore()──────────┘               complete()
//!       │                                         ▼
//!       └────────────free_slot()─────────── COMPLETED
//! ```
//!
//! Reservation and completion both advance in ring order, so descriptors
//! always complete in the order they were posted.
//!
//! [`PendingList`] holds channels whose replenishment failed on a
//! transient resource shortage, for retry once resources return.

#![no_std]

extern crate alloc;

pub mod channel;
pub mod error;
pub mod pending;

pub use channel::{Channel, ChannelStats, ChannelType, Descriptor, DtrState};
pub use error::{ChannelError, Result};
pub use pending::PendingList;
