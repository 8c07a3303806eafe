//! Fixed-length descriptor ring.

use alloc::vec::Vec;

use crate::error::{ChannelError, Result};

const TARGET: &str = "vxge::channel";

/// Kind of hardware queue a channel backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Transmit fifo.
    Fifo,
    /// Receive ring.
    Ring,
}

/// Lifecycle state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtrState {
    #[default]
    Free,
    Reserved,
    Posted,
    Completed,
}

/// A slot handed out by [`Channel::reserve`] or [`Channel::try_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<H> {
    /// Absolute slot index.
    pub index: usize,
    /// Descriptor handle bound to the slot, if any.
    pub dtr: Option<H>,
}

#[derive(Debug, Clone, Copy)]
struct Slot<H> {
    dtr: Option<H>,
    hal_priv: Option<usize>,
    state: DtrState,
}

impl<H> Slot<H> {
    const fn new() -> Self {
        Self {
            dtr: None,
            hal_priv: None,
            state: DtrState::Free,
        }
    }
}

/// Ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub length: usize,
    pub reserve_index: usize,
    pub compl_index: usize,
    /// Reservations refused because the ring was full.
    pub ring_full: u64,
    /// Descriptors completed over the channel's lifetime.
    pub total_compl: u64,
    pub free: usize,
    pub reserved: usize,
    pub posted: usize,
    pub completed: usize,
}

/// Descriptor ring of `length` slots.
///
/// `H` is the opaque descriptor handle stored per slot; `U` is caller
/// data carried by the channel. No internal locking: callers serialize
/// producer and consumer access.
pub struct Channel<H, U = ()> {
    ty: ChannelType,
    slots: Vec<Slot<H>>,
    uld_priv: Vec<u8>,
    per_item_space: usize,
    reserve_index: usize,
    compl_index: usize,
    owner: Option<usize>,
    userdata: U,
    ring_full: u64,
    total_compl: u64,
}

impl<H: Copy + PartialEq, U> Channel<H, U> {
    /// Allocate a channel with every slot `Free` and both indices at 0.
    ///
    /// `per_item_space` bytes of zeroed caller-private storage are
    /// reserved per slot.
    pub fn allocate(ty: ChannelType, length: usize, per_item_space: usize, userdata: U) -> Result<Self> {
        if length == 0 {
            return Err(ChannelError::InvalidLength(length));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(length)
            .map_err(|_| ChannelError::OutOfMemory)?;
        slots.resize_with(length, Slot::new);

        let priv_len = length
            .checked_mul(per_item_space)
            .ok_or(ChannelError::OutOfMemory)?;
        let mut uld_priv = Vec::new();
        uld_priv
            .try_reserve_exact(priv_len)
            .map_err(|_| ChannelError::OutOfMemory)?;
        uld_priv.resize(priv_len, 0u8);

        log::debug!(
            target: TARGET,
            "allocated {:?} channel: length={} per_item_space={}",
            ty,
            length,
            per_item_space
        );

        Ok(Self {
            ty,
            slots,
            uld_priv,
            per_item_space,
            reserve_index: 0,
            compl_index: 0,
            owner: None,
            userdata,
            ring_full: 0,
            total_compl: 0,
        })
    }

    /// Attach the channel to its owning queue.
    pub fn initialize(&mut self, owner: usize) {
        self.owner = Some(owner);
    }

    /// Detach the channel from its owning queue.
    pub fn terminate(&mut self) {
        self.owner = None;
    }

    /// Rewind both indices and mark every slot `Free`. Descriptor
    /// bindings and private data are kept.
    pub fn reset(&mut self) {
        self.reserve_index = 0;
        self.compl_index = 0;
        for slot in &mut self.slots {
            slot.state = DtrState::Free;
        }
        log::trace!(target: TARGET, "reset {:?} channel", self.ty);
    }

    #[inline]
    pub fn channel_type(&self) -> ChannelType {
        self.ty
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    #[inline]
    pub fn reserve_index(&self) -> usize {
        self.reserve_index
    }

    #[inline]
    pub fn compl_index(&self) -> usize {
        self.compl_index
    }

    pub fn userdata(&self) -> &U {
        &self.userdata
    }

    pub fn userdata_mut(&mut self) -> &mut U {
        &mut self.userdata
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Reserve the slot at the reservation point.
    ///
    /// Returns [`ChannelError::OutOfDescriptors`] when that slot is not
    /// `Free`; the ring-full counter records it.
    pub fn reserve(&mut self) -> Result<Descriptor<H>> {
        let index = self.reserve_index;
        let slot = &mut self.slots[index];
        if slot.state != DtrState::Free {
            self.ring_full += 1;
            return Err(ChannelError::OutOfDescriptors);
        }
        slot.state = DtrState::Reserved;
        let dtr = slot.dtr;
        self.reserve_index = self.wrap_next(index);
        Ok(Descriptor { index, dtr })
    }

    /// Mark slot `index` `Posted`. The caller posts only slots it reserved.
    pub fn post(&mut self, index: usize) -> Result<()> {
        self.slot_mut(index)?.state = DtrState::Posted;
        Ok(())
    }

    /// Peek at the completion point without advancing it.
    pub fn try_complete(&self) -> Option<Descriptor<H>> {
        let index = self.compl_index;
        let slot = &self.slots[index];
        if slot.state != DtrState::Posted {
            return None;
        }
        Some(Descriptor {
            index,
            dtr: slot.dtr,
        })
    }

    /// Mark the slot at the completion point `Completed` and advance.
    ///
    /// Call only after [`try_complete`](Self::try_complete) returned a
    /// descriptor.
    pub fn complete(&mut self) {
        let index = self.compl_index;
        self.slots[index].state = DtrState::Completed;
        self.compl_index = self.wrap_next(index);
        self.total_compl += 1;
    }

    /// Return slot `index` to `Free`.
    pub fn free_slot(&mut self, index: usize) -> Result<()> {
        self.slot_mut(index)?.state = DtrState::Free;
        Ok(())
    }

    /// Abort a reservation: hand the slot just behind the reservation
    /// point back to the ring.
    ///
    /// Happens only if that slot is bound to `dtr`; otherwise nothing
    /// changes and a warning is logged. Returns whether the slot was
    /// restored. The slot must still be `Reserved`; debug builds assert it.
    pub fn restore(&mut self, dtr: H) -> bool {
        let index = if self.reserve_index == 0 {
            self.length() - 1
        } else {
            self.reserve_index - 1
        };
        let slot = &mut self.slots[index];
        if slot.dtr != Some(dtr) {
            log::warn!(
                target: TARGET,
                "restore: slot {} does not hold the descriptor being restored",
                index
            );
            return false;
        }
        debug_assert_eq!(
            slot.state,
            DtrState::Reserved,
            "restore: slot {} is no longer reserved",
            index
        );
        slot.state = DtrState::Free;
        self.reserve_index = index;
        true
    }

    // ------------------------------------------------------------------------
    // Slot side data
    // ------------------------------------------------------------------------

    /// Bind descriptor handle `dtr` to slot `index`.
    pub fn set_dtr(&mut self, index: usize, dtr: H) -> Result<()> {
        self.slot_mut(index)?.dtr = Some(dtr);
        Ok(())
    }

    pub fn dtr(&self, index: usize) -> Option<H> {
        self.slots.get(index).and_then(|slot| slot.dtr)
    }

    pub fn set_hal_priv(&mut self, index: usize, hal_priv: usize) -> Result<()> {
        self.slot_mut(index)?.hal_priv = Some(hal_priv);
        Ok(())
    }

    pub fn hal_priv(&self, index: usize) -> Option<usize> {
        self.slots.get(index).and_then(|slot| slot.hal_priv)
    }

    /// Caller-private bytes of slot `index`.
    pub fn uld_priv(&self, index: usize) -> Option<&[u8]> {
        if index >= self.length() {
            return None;
        }
        let start = index * self.per_item_space;
        self.uld_priv.get(start..start + self.per_item_space)
    }

    pub fn uld_priv_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        if index >= self.length() {
            return None;
        }
        let start = index * self.per_item_space;
        self.uld_priv.get_mut(start..start + self.per_item_space)
    }

    pub fn state(&self, index: usize) -> Option<DtrState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    pub fn stats(&self) -> ChannelStats {
        let mut stats = ChannelStats {
            length: self.length(),
            reserve_index: self.reserve_index,
            compl_index: self.compl_index,
            ring_full: self.ring_full,
            total_compl: self.total_compl,
            ..ChannelStats::default()
        };
        for slot in &self.slots {
            match slot.state {
                DtrState::Free => stats.free += 1,
                DtrState::Reserved => stats.reserved += 1,
                DtrState::Posted => stats.posted += 1,
                DtrState::Completed => stats.completed += 1,
            }
        }
        stats
    }

    #[inline]
    fn wrap_next(&self, index: usize) -> usize {
        if index + 1 == self.length() {
            0
        } else {
            index + 1
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot<H>> {
        let length = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(ChannelError::InvalidIndex { index, length })
    }
}

impl<H, U> core::fmt::Debug for Channel<H, U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("type", &self.ty)
            .field("length", &self.slots.len())
            .field("reserve_index", &self.reserve_index)
            .field("compl_index", &self.compl_index)
            .field("owner", &self.owner)
            .finish()
    }
}
