//! # revent — an event-notification reactor
//!
//! Multiplexes fd readiness, elapsed timers and delivered signals onto
//! one dispatch loop, invoking user callbacks in priority order under a
//! well-defined concurrency contract.
//!
//! ## Architecture
//!
//! ```text
//!                        Base (dispatch driver)
//!                              │
//!       ┌───────────┬──────────┼───────────┬──────────────┐
//!       ▼           ▼          ▼           ▼              ▼
//!   MinHeap     IoMap /    Changelist   Backend       SignalShim
//!   +buckets   SignalMap   (coalesce)   (epoll)      (self-pipe)
//!       │           │          │           │              │
//!       └───────────┴──────────┴─────┬─────┴──────────────┘
//!                                    ▼
//!                      activation queues, by priority
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use revent::{Base, EventMask};
//! use std::time::Duration;
//!
//! let base = Base::new()?;
//! let tick = base.timer_event(EventMask::PERSIST, |_, _| {
//!     println!("tick");
//! });
//! tick.add(Some(Duration::from_millis(100)))?;
//! base.dispatch()?;
//! ```
//!
//! One base runs its loop on one thread at a time; callbacks execute on
//! that thread with the base lock released, so they may freely re-enter
//! the library. Registration and activation are allowed from any
//! thread and wake a blocked loop through an internal eventfd.

mod backend;
mod base;
mod changelist;
mod config;
mod event;
mod evmap;
mod minheap;
mod notify;
mod signal;
pub mod sync;
mod time;

pub use backend::BackendFeatures;
pub use base::{Base, BaseStats, CommonTimeout, Event, LoopFlags};
pub use config::{Config, MAX_PRIORITIES};
pub use revent_core::{EventFlags, EventMask, ReventError, Result};
pub use sync::{
    enable_lock_debugging, set_id_callback, set_thread_callbacks, use_std_threads, LockKind,
    RawCond, RawLock, StdThreads, ThreadCallbacks,
};

/// errno of the most recent failed syscall on this thread.
#[inline]
pub(crate) fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
