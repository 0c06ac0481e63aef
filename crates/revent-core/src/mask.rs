//! Event interest and result masks

use bitflags::bitflags;

bitflags! {
    /// What an event is interested in, and (at activation time) which of
    /// those conditions fired.
    ///
    /// The numeric values are stable; callers that persist or exchange
    /// masks may rely on them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u8 {
        /// A timeout expired. Result-only: never part of an interest mask.
        const TIMEOUT = 0x01;
        /// The fd became readable.
        const READ = 0x02;
        /// The fd became writable.
        const WRITE = 0x04;
        /// A signal was delivered.
        const SIGNAL = 0x08;
        /// Keep the event registered across firings.
        const PERSIST = 0x10;
        /// Edge-triggered readiness: reported once per state transition.
        const ET = 0x20;
        /// Deferred destruction was requested for this event.
        const FINALIZE = 0x40;
        /// The peer half-closed the connection (early close).
        const CLOSED = 0x80;
    }
}

impl EventMask {
    /// The conditions a backend can actually watch on an fd.
    pub const IO: EventMask = EventMask::READ
        .union(EventMask::WRITE)
        .union(EventMask::CLOSED);

    /// Just the I/O bits of this mask.
    #[inline]
    pub fn io_bits(self) -> EventMask {
        self & Self::IO
    }

    /// True if any I/O condition is present.
    #[inline]
    pub fn has_io(self) -> bool {
        self.intersects(Self::IO)
    }
}
