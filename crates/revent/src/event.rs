//! The event record
//!
//! Records live in a slab arena owned by the base; the caller-facing
//! [`crate::Event`] handle addresses one by id + generation, so a stale
//! handle (the record was freed and the slot reused) is inert.

use std::os::unix::io::RawFd;
use std::time::Duration;

use revent_core::{EventFlags, EventMask};

use crate::time::Deadline;

pub(crate) type EventId = usize;

/// What the event watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Fd(RawFd),
    Signal(i32),
    /// Pure timer, or library plumbing with no descriptor.
    None,
}

impl Target {
    /// First argument handed to the user callback: the fd, the signal
    /// number, or -1.
    pub fn callback_arg(self) -> i32 {
        match self {
            Target::Fd(fd) => fd,
            Target::Signal(sig) => sig,
            Target::None => -1,
        }
    }
}

/// Where a scheduled event sits in the timer store. Exactly one variant
/// holds at a time; `Heap` and `Common` never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutPos {
    None,
    /// Index into the min-heap array.
    Heap(usize),
    /// Member of the given common-timeout bucket.
    Common(usize),
}

/// The timeout the caller asked for, kept for persistent re-scheduling.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimeoutKind {
    Relative(Duration),
    /// Index of a shared common-timeout bucket.
    Common(usize),
}

pub(crate) type UserCallback = Box<dyn FnMut(i32, EventMask) + Send>;
pub(crate) type FinalizeFn = Box<dyn FnOnce(i32) + Send>;

/// How an activation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Run the user callback (honoring persist / pending-call count).
    User,
    /// Drain the base's wakeup eventfd.
    NotifyDrain,
    /// Drain the signal self-pipe and activate registered signal events.
    SignalDrain,
    /// One-shot internal timer that ends the loop.
    LoopExit,
    /// Bucket-head for the given common-timeout list; expiry advances
    /// the bucket instead of running a callback.
    CommonHead(usize),
}

pub(crate) struct EventRecord {
    pub target: Target,
    pub interest: EventMask,
    pub priority: usize,
    pub kind: Kind,
    /// Present for `Kind::User`; taken out while the callback runs.
    pub callback: Option<UserCallback>,
    pub finalizer: Option<FinalizeFn>,
    pub flags: EventFlags,
    /// Why the event fired; delivered to the callback, then cleared.
    pub result: EventMask,
    /// Callback invocations owed by the queued activation.
    pub ncalls: u16,
    /// Invocations still owed by the activation being delivered right
    /// now. Kept apart from `ncalls` so a re-activation from inside the
    /// callback queues afresh instead of feeding the running loop.
    pub calls_in_flight: u16,
    pub timeout: Option<TimeoutKind>,
    /// Valid while scheduled; the heap key.
    pub deadline: Deadline,
    /// Schedule-order tie-break for equal deadlines.
    pub seq: u64,
    pub timeout_pos: TimeoutPos,
    pub generation: u64,
    /// The handle was dropped while the callback was in flight; the
    /// driver frees the record when the callback returns.
    pub pending_free: bool,
}

impl EventRecord {
    pub fn new(
        target: Target,
        interest: EventMask,
        priority: usize,
        kind: Kind,
        callback: Option<UserCallback>,
        generation: u64,
    ) -> Self {
        EventRecord {
            target,
            interest,
            priority,
            kind,
            callback,
            finalizer: None,
            flags: EventFlags::INIT,
            result: EventMask::empty(),
            ncalls: 0,
            calls_in_flight: 0,
            timeout: None,
            deadline: Deadline::ZERO,
            seq: 0,
            timeout_pos: TimeoutPos::None,
            generation,
            pending_free: false,
        }
    }
}
