//! Event lifecycle flags
//!
//! An event's flags record which queues and structures it currently
//! belongs to. Exactly one consistent subset is set at any instant:
//! a freshly assigned event is `INIT`; a registered event is `INSERTED`
//! (plus `TIMEOUT` if it is scheduled and `SIGNAL` if it watches a
//! signal); a fired event is additionally `ACTIVE` or `ACTIVE_LATER`
//! while it sits in an activation queue.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u8 {
        /// Scheduled in the timer store (heap or common-timeout bucket).
        const TIMEOUT = 0x01;
        /// Registered with the base (fd map, signal map, or pure timer).
        const INSERTED = 0x02;
        /// Watches a signal number.
        const SIGNAL = 0x04;
        /// Queued in an activation queue.
        const ACTIVE = 0x08;
        /// Owned by the library itself; invisible to emptiness checks.
        const INTERNAL = 0x10;
        /// Queued for activation at the start of the next pass.
        const ACTIVE_LATER = 0x20;
        /// Deferred destruction in progress; no further activation.
        const FINALIZING = 0x40;
        /// Assigned but not registered anywhere.
        const INIT = 0x80;
    }
}

impl EventFlags {
    /// True if the event sits in an activation queue (now or next pass).
    #[inline]
    pub fn is_queued_active(self) -> bool {
        self.intersects(EventFlags::ACTIVE | EventFlags::ACTIVE_LATER)
    }

    /// True if the event is registered with a base.
    #[inline]
    pub fn is_inserted(self) -> bool {
        self.contains(EventFlags::INSERTED)
    }

    /// True for events the library owns for its own plumbing.
    #[inline]
    pub fn is_internal(self) -> bool {
        self.contains(EventFlags::INTERNAL)
    }
}
