//! Pending-channel retry list.
//!
//! Channels whose replenishment failed on a transient shortage wait here
//! until resources return. The list is shared by every channel of a
//! device, so it carries its own lock; the retry itself runs with the
//! lock released.

use spin::Mutex;
use vxge_list::List;

use crate::error::ChannelError;

const TARGET: &str = "vxge::pending";

/// Lock-protected FIFO of entries awaiting a retry.
pub struct PendingList<T> {
    entries: Mutex<List<T>>,
}

impl<T> PendingList<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(List::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Append `entry`, then drain the whole list with `retry`.
    pub fn insert<F>(&self, entry: T, retry: F) -> usize
    where
        F: FnMut(&T) -> Result<(), ChannelError>,
    {
        self.entries.lock().push_back(entry);
        self.process(retry)
    }

    /// Retry entries front to back.
    ///
    /// A transient failure puts the entry back at the front and stops the
    /// drain. Any other failure discards the entry and moves on. Returns
    /// the number of entries retried successfully.
    pub fn process<F>(&self, mut retry: F) -> usize
    where
        F: FnMut(&T) -> Result<(), ChannelError>,
    {
        let mut done = 0;
        loop {
            let Some(entry) = self.entries.lock().pop_front() else {
                break;
            };
            match retry(&entry) {
                Ok(()) => done += 1,
                Err(e) if e.is_transient() => {
                    log::trace!(target: TARGET, "retry still short: {}", e);
                    self.entries.lock().push_front(entry);
                    break;
                }
                Err(e) => {
                    log::warn!(target: TARGET, "dropping pending entry: {}", e);
                }
            }
        }
        done
    }

    /// Discard every entry.
    pub fn destroy(&self) {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            log::debug!(target: TARGET, "discarding {} pending entries", entries.len());
        }
        entries.clear();
    }
}

impl<T> Default for PendingList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PendingList<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_insert_drains_on_success() {
        let pending = PendingList::new();
        let mut seen = Vec::new();
        let done = pending.insert(7u32, |&id| {
            seen.push(id);
            Ok(())
        });
        assert_eq!(done, 1);
        assert_eq!(seen, [7]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_transient_failure_reinserts_at_front() {
        let pending = PendingList::new();
        pending.insert(1u32, |_| Err(ChannelError::OutOfMemory));
        pending.insert(2u32, |_| Err(ChannelError::OutOfMemory));
        assert_eq!(pending.len(), 2);

        let mut tried = Vec::new();
        let done = pending.process(|&id| {
            tried.push(id);
            Err(ChannelError::OutOfMemory)
        });
        assert_eq!(done, 0);
        // Stopped at the first entry, which went back to the front.
        assert_eq!(tried, [1]);
        assert_eq!(pending.len(), 2);

        let mut order = Vec::new();
        pending.process(|&id| {
            order.push(id);
            Ok(())
        });
        assert_eq!(order, [1, 2]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_hard_failure_drops_entry_and_continues() {
        let pending = PendingList::new();
        pending.insert(1u32, |_| Err(ChannelError::OutOfMemory));
        pending.insert(2u32, |_| Err(ChannelError::OutOfMemory));

        let done = pending.process(|&id| {
            if id == 1 {
                Err(ChannelError::InvalidLength(0))
            } else {
                Ok(())
            }
        });
        assert_eq!(done, 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_destroy_discards_entries() {
        let pending = PendingList::new();
        pending.insert(1u32, |_| Err(ChannelError::OutOfMemory));
        pending.destroy();
        assert!(pending.is_empty());
    }
}
