//! Registration maps
//!
//! Two mappings: fd → the events interested in it, and signal number →
//! the events watching it. The fd side also tracks the combined interest
//! mask, so an add or delete yields the (old, new) effective-mask pair
//! the backend needs — the backend is always told the union of live
//! interests, never a single event's view.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use slab::Slab;
use smallvec::SmallVec;

use revent_core::EventMask;

use crate::event::{EventId, EventRecord, Target};

/// Effective-mask transition for one fd, handed to the changelist or
/// straight to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MaskDelta {
    pub fd: RawFd,
    pub old: EventMask,
    pub new: EventMask,
}

#[derive(Default)]
struct IoEntry {
    events: SmallVec<[EventId; 2]>,
    /// OR of live interests (I/O bits, plus ET when any event wants it).
    mask: EventMask,
}

pub(crate) struct IoMap {
    map: HashMap<RawFd, IoEntry>,
}

impl IoMap {
    pub fn new() -> Self {
        IoMap {
            map: HashMap::new(),
        }
    }

    fn fd_of(ev: &Slab<EventRecord>, id: EventId) -> RawFd {
        match ev[id].target {
            Target::Fd(fd) => fd,
            _ => unreachable!("io map entry without an fd target"),
        }
    }

    fn combined(ev: &Slab<EventRecord>, ids: &[EventId]) -> EventMask {
        let mut mask = EventMask::empty();
        let mut et = false;
        for &id in ids {
            mask |= ev[id].interest.io_bits();
            if ev[id].interest.contains(EventMask::ET) {
                et = true;
            }
        }
        if et && !mask.is_empty() {
            mask |= EventMask::ET;
        }
        mask
    }

    /// Register `id` under its fd. Returns the mask transition if the
    /// effective interest changed.
    pub fn add(&mut self, ev: &Slab<EventRecord>, id: EventId) -> Option<MaskDelta> {
        let fd = Self::fd_of(ev, id);
        let entry = self.map.entry(fd).or_default();
        entry.events.push(id);
        let old = entry.mask;
        let new = Self::combined(ev, &entry.events);
        entry.mask = new;
        (new != old).then_some(MaskDelta { fd, old, new })
    }

    /// Drop `id` from its fd's list, symmetric to `add`.
    pub fn del(&mut self, ev: &Slab<EventRecord>, id: EventId) -> Option<MaskDelta> {
        let fd = Self::fd_of(ev, id);
        let entry = self.map.get_mut(&fd)?;
        entry.events.retain(|&mut e| e != id);
        let old = entry.mask;
        let new = Self::combined(ev, &entry.events);
        entry.mask = new;
        if entry.events.is_empty() {
            self.map.remove(&fd);
        }
        (new != old).then_some(MaskDelta { fd, old, new })
    }

    /// Which events fire for readiness `what` on `fd`, and with which
    /// result masks. Edge semantics are reported only to events that
    /// asked for them.
    pub fn hits(
        &self,
        ev: &Slab<EventRecord>,
        fd: RawFd,
        what: EventMask,
    ) -> SmallVec<[(EventId, EventMask); 4]> {
        let mut out = SmallVec::new();
        if let Some(entry) = self.map.get(&fd) {
            for &id in &entry.events {
                let interest = ev[id].interest;
                let mut res = interest & what & EventMask::IO;
                if res.is_empty() {
                    continue;
                }
                if what.contains(EventMask::ET) && interest.contains(EventMask::ET) {
                    res |= EventMask::ET;
                }
                out.push((id, res));
            }
        }
        out
    }

    /// (fd, effective mask) for every registered fd. Used to rebuild the
    /// kernel table after fork.
    pub fn entries(&self) -> impl Iterator<Item = (RawFd, EventMask)> + '_ {
        self.map.iter().map(|(&fd, e)| (fd, e.mask))
    }

    #[cfg(test)]
    pub fn mask_of(&self, fd: RawFd) -> EventMask {
        self.map.get(&fd).map(|e| e.mask).unwrap_or_default()
    }
}

pub(crate) struct SignalMap {
    map: HashMap<i32, SmallVec<[EventId; 2]>>,
}

impl SignalMap {
    pub fn new() -> Self {
        SignalMap {
            map: HashMap::new(),
        }
    }

    /// Register `id` for `sig`. True if this is the first watcher, i.e.
    /// the OS handler must be installed.
    pub fn add(&mut self, sig: i32, id: EventId) -> bool {
        let list = self.map.entry(sig).or_default();
        list.push(id);
        list.len() == 1
    }

    /// Drop `id` from `sig`'s list. True if it was the last watcher,
    /// i.e. the previous OS handler should be restored.
    pub fn del(&mut self, sig: i32, id: EventId) -> bool {
        if let Some(list) = self.map.get_mut(&sig) {
            list.retain(|&mut e| e != id);
            if list.is_empty() {
                self.map.remove(&sig);
                return true;
            }
        }
        false
    }

    pub fn ids(&self, sig: i32) -> SmallVec<[EventId; 2]> {
        self.map.get(&sig).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Kind;

    fn io_record(ev: &mut Slab<EventRecord>, fd: RawFd, interest: EventMask) -> EventId {
        ev.insert(EventRecord::new(
            Target::Fd(fd),
            interest,
            0,
            Kind::User,
            None,
            1,
        ))
    }

    #[test]
    fn test_effective_mask_is_union_of_interests() {
        let mut ev = Slab::new();
        let mut io = IoMap::new();

        let r = io_record(&mut ev, 5, EventMask::READ);
        let w = io_record(&mut ev, 5, EventMask::WRITE | EventMask::PERSIST);

        let d1 = io.add(&ev, r).unwrap();
        assert_eq!(d1.old, EventMask::empty());
        assert_eq!(d1.new, EventMask::READ);

        let d2 = io.add(&ev, w).unwrap();
        assert_eq!(d2.old, EventMask::READ);
        assert_eq!(d2.new, EventMask::READ | EventMask::WRITE);

        // a second reader changes nothing at the backend
        let r2 = io_record(&mut ev, 5, EventMask::READ);
        assert!(io.add(&ev, r2).is_none());

        // removing one reader changes nothing either
        assert!(io.del(&ev, r).is_none());
        assert_eq!(io.mask_of(5), EventMask::READ | EventMask::WRITE);

        let d3 = io.del(&ev, r2).unwrap();
        assert_eq!(d3.new, EventMask::WRITE);

        let d4 = io.del(&ev, w).unwrap();
        assert_eq!(d4.new, EventMask::empty());
        assert_eq!(io.mask_of(5), EventMask::empty());
    }

    #[test]
    fn test_edge_triggered_aggregation() {
        let mut ev = Slab::new();
        let mut io = IoMap::new();

        let plain = io_record(&mut ev, 9, EventMask::READ);
        let edgy = io_record(&mut ev, 9, EventMask::WRITE | EventMask::ET);

        io.add(&ev, plain);
        let d = io.add(&ev, edgy).unwrap();
        // one edge-triggered event makes the combined registration edge-triggered
        assert!(d.new.contains(EventMask::ET));

        // but only the event that asked sees edge semantics in its result
        let what = EventMask::READ | EventMask::WRITE | EventMask::ET;
        let hits = io.hits(&ev, 9, what);
        assert_eq!(hits.len(), 2);
        let res_plain = hits.iter().find(|(id, _)| *id == plain).unwrap().1;
        let res_edgy = hits.iter().find(|(id, _)| *id == edgy).unwrap().1;
        assert_eq!(res_plain, EventMask::READ);
        assert_eq!(res_edgy, EventMask::WRITE | EventMask::ET);
    }

    #[test]
    fn test_hits_intersect_interest() {
        let mut ev = Slab::new();
        let mut io = IoMap::new();

        let r = io_record(&mut ev, 3, EventMask::READ);
        let w = io_record(&mut ev, 3, EventMask::WRITE);
        io.add(&ev, r);
        io.add(&ev, w);

        let hits = io.hits(&ev, 3, EventMask::READ);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], (r, EventMask::READ));

        assert!(io.hits(&ev, 4, EventMask::READ).is_empty());
    }

    #[test]
    fn test_signal_map_first_and_last() {
        let mut sigs = SignalMap::new();
        assert!(sigs.add(10, 1));
        assert!(!sigs.add(10, 2));
        assert_eq!(sigs.ids(10).as_slice(), &[1, 2]);

        assert!(!sigs.del(10, 1));
        assert!(sigs.del(10, 2));
        assert!(sigs.ids(10).is_empty());

        // deleting on an empty list is a no-op
        assert!(!sigs.del(10, 2));
    }
}
