//! Changelist: coalesced backend deltas
//!
//! Registration churn between two dispatch passes collapses into one
//! pending change per fd. Each slot snapshots the mask the backend
//! currently knows (`old_mask`, taken on first touch) and accumulates
//! per-direction add/delete intents; an add followed by a delete of the
//! same interest nets out to nothing by the time the backend looks.
//! Short-lived connections produce add-then-delete storms, and one
//! coalesced syscall instead of two is the whole point.
//!
//! Changelist mode is opt-in per base (config flag or
//! `EVENT_EPOLL_USE_CHANGELIST`); without it every delta goes to the
//! backend synchronously, expressed as a one-off `Change`.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use revent_core::EventMask;

use crate::evmap::MaskDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ChangeOp {
    #[default]
    None,
    Add,
    Del,
}

/// One pending per-fd delta.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Change {
    pub fd: RawFd,
    /// Effective mask the backend holds for this fd (pre-change).
    pub old_mask: EventMask,
    pub read_change: ChangeOp,
    pub write_change: ChangeOp,
    pub close_change: ChangeOp,
    /// The resulting registration wants edge-triggered reporting.
    pub et: bool,
}

impl Change {
    fn empty(fd: RawFd, old_mask: EventMask) -> Self {
        Change {
            fd,
            old_mask,
            read_change: ChangeOp::None,
            write_change: ChangeOp::None,
            close_change: ChangeOp::None,
            et: old_mask.contains(EventMask::ET),
        }
    }

    /// Express a mask transition as a single change (the synchronous,
    /// no-changelist path).
    pub fn from_masks(fd: RawFd, old: EventMask, new: EventMask) -> Self {
        let mut ch = Change::empty(fd, old);
        ch.merge(&MaskDelta { fd, old, new });
        ch
    }

    fn merge(&mut self, delta: &MaskDelta) {
        for (bit, op) in [
            (EventMask::READ, &mut self.read_change),
            (EventMask::WRITE, &mut self.write_change),
            (EventMask::CLOSED, &mut self.close_change),
        ] {
            if delta.new.contains(bit) && !delta.old.contains(bit) {
                *op = ChangeOp::Add;
            } else if delta.old.contains(bit) && !delta.new.contains(bit) {
                *op = ChangeOp::Del;
            }
        }
        self.et = delta.new.contains(EventMask::ET)
            || (!delta.new.has_io() && delta.old.contains(EventMask::ET));
    }

    /// The effective mask after this change is applied.
    pub fn new_mask(&self) -> EventMask {
        let mut m = self.old_mask.io_bits();
        for (bit, op) in [
            (EventMask::READ, self.read_change),
            (EventMask::WRITE, self.write_change),
            (EventMask::CLOSED, self.close_change),
        ] {
            match op {
                ChangeOp::Add => m |= bit,
                ChangeOp::Del => m -= bit,
                ChangeOp::None => {}
            }
        }
        m
    }
}

pub(crate) struct Changelist {
    changes: Vec<Change>,
    /// Sparse fd → slot index, so repeat changes on one fd coalesce.
    index: HashMap<RawFd, usize>,
}

impl Changelist {
    pub fn new() -> Self {
        Changelist {
            changes: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Fold a mask transition into the fd's pending slot.
    pub fn record(&mut self, delta: &MaskDelta) {
        let idx = match self.index.get(&delta.fd).copied() {
            Some(i) => i,
            None => {
                // first touch this pass: old is what the backend knows
                self.index.insert(delta.fd, self.changes.len());
                self.changes.push(Change::empty(delta.fd, delta.old));
                self.changes.len() - 1
            }
        };
        self.changes[idx].merge(delta);
    }

    /// Hand over all pending changes and reset.
    pub fn take(&mut self) -> Vec<Change> {
        self.index.clear();
        std::mem::take(&mut self.changes)
    }
}
