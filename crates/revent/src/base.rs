//! The base: registration surface and dispatch driver
//!
//! A base owns one backend instance, the timer heap, the fd/signal maps,
//! the changelist, the priority-indexed activation queues, and one
//! recursive lock protecting all of it. One thread at a time drives the
//! loop; registrations may come from any thread, and a wakeup eventfd
//! cuts the backend wait short when they do.
//!
//! Every dispatch pass: flush the changelist, compute the soonest
//! deadline, wait in the backend with the lock released, fan readiness
//! out through the maps, drain expired timers, promote deferred
//! activations, then run activation queues strictly by ascending
//! priority with the lock released around each callback.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use slab::Slab;
use smallvec::SmallVec;

use revent_core::{env_is_set, ev_debug, ev_warn, EventFlags, EventMask, ReventError, Result};

use crate::backend::{self, Backend, BackendFeatures, BackendInfo, BackendOpts, Ready};
use crate::changelist::{Change, Changelist};
use crate::config::{Config, MAX_PRIORITIES};
use crate::event::{EventId, EventRecord, Kind, Target, TimeoutKind, TimeoutPos, UserCallback};
use crate::evmap::{IoMap, MaskDelta, SignalMap};
use crate::minheap::{CommonTimeoutList, MinHeap};
use crate::notify::Notifier;
use crate::signal::SignalShim;
use crate::sync::{self, LockKind, RawCond, RawLock};
use crate::time::Deadline;

bitflags! {
    /// Flags for [`Base::run`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoopFlags: u8 {
        /// Return after a single dispatch pass, whether or not any
        /// callback ran.
        const ONCE = 0x01;
        /// Poll instead of blocking; return after at most one pass.
        const NONBLOCK = 0x02;
        /// Keep looping even when no events are registered.
        const NO_EXIT_ON_EMPTY = 0x04;
    }
}

/// Counters and gauges for one base.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseStats {
    /// Backend waits entered.
    pub dispatches: u64,
    /// User callbacks invoked.
    pub callbacks: u64,
    /// Registration changes handed to the backend.
    pub changes_applied: u64,
    /// Currently registered (non-internal) events.
    pub events: usize,
    /// Events sitting in activation queues.
    pub active: usize,
}

#[derive(Default)]
struct StatCounters {
    dispatches: u64,
    callbacks: u64,
    changes_applied: u64,
}

/// Handle to a shared-timeout bucket created by [`Base::common_timeout`].
#[derive(Debug, Clone, Copy)]
pub struct CommonTimeout {
    idx: usize,
}

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) struct BaseState {
    slab: Slab<EventRecord>,
    heap: MinHeap,
    common: Vec<CommonTimeoutList>,
    io: IoMap,
    signals: SignalMap,
    sig_shim: Option<SignalShim>,
    sig_shim_ev: Option<EventId>,
    changelist: Changelist,
    changelist_enabled: bool,
    queues: Vec<VecDeque<EventId>>,
    active_later: VecDeque<EventId>,
    active_count: usize,
    /// Registered events, internal plumbing excluded.
    event_count: usize,
    seq: u64,
    gen: u64,
    /// Thread driving the loop, while one is.
    running: Option<u64>,
    /// Event whose callback is executing right now.
    current: Option<EventId>,
    loop_break: bool,
    loop_exit: bool,
    loopexit_ev: Option<EventId>,
    stats: StatCounters,
}

impl BaseState {
    fn alloc_record(
        &mut self,
        target: Target,
        interest: EventMask,
        priority: usize,
        kind: Kind,
        callback: Option<UserCallback>,
        internal: bool,
    ) -> EventId {
        self.gen += 1;
        let mut rec = EventRecord::new(target, interest, priority, kind, callback, self.gen);
        if internal {
            rec.flags.insert(EventFlags::INTERNAL);
        }
        self.slab.insert(rec)
    }

    fn is_live(&self, id: EventId, gen: u64) -> bool {
        self.slab.contains(id) && self.slab[id].generation == gen
    }

    fn has_active(&self) -> bool {
        self.active_count > 0 || !self.active_later.is_empty()
    }

    fn first_active_priority(&self) -> Option<usize> {
        self.queues.iter().position(|q| !q.is_empty())
    }

    fn next_deadline_duration(&self, now: Deadline) -> Option<Duration> {
        self.heap
            .peek()
            .map(|id| self.slab[id].deadline.remaining(now))
    }

    fn io_hits(&self, fd: RawFd, what: EventMask) -> SmallVec<[(EventId, EventMask); 4]> {
        self.io.hits(&self.slab, fd, what)
    }
}

pub(crate) struct BaseInner {
    lock: Box<dyn RawLock>,
    /// Signaled when a running callback completes; blocking delete and
    /// the finalization handshake wait on it.
    cb_done: Box<dyn RawCond>,
    state: UnsafeCell<BaseState>,
    backend: UnsafeCell<Box<dyn Backend>>,
    notify: Notifier,
    info: &'static BackendInfo,
    opts: BackendOpts,
}

// Safety: `state` is only reached through `lock_state()`, which holds
// `lock` for the guard's lifetime and hands out only short-lived
// borrows. `backend` is used through shared references except in
// `reinit`, which requires the lock plus no running loop.
unsafe impl Send for BaseInner {}
unsafe impl Sync for BaseInner {}

/// Holds the base lock; derefs to the state. At most one guard per
/// thread: internal code never re-locks while holding one.
struct Guard<'a> {
    inner: &'a BaseInner,
}

impl std::ops::Deref for Guard<'_> {
    type Target = BaseState;
    fn deref(&self) -> &BaseState {
        unsafe { &*self.inner.state.get() }
    }
}

impl std::ops::DerefMut for Guard<'_> {
    fn deref_mut(&mut self) -> &mut BaseState {
        unsafe { &mut *self.inner.state.get() }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.inner.lock.unlock();
    }
}

impl BaseInner {
    fn lock_state(&self) -> Guard<'_> {
        self.lock.lock();
        Guard { inner: self }
    }

    fn backend(&self) -> &dyn Backend {
        unsafe { &**self.backend.get() }
    }

    /// Cut a foreign loop's backend wait short.
    fn wake_loop(&self, st: &BaseState) {
        if let Some(owner) = st.running {
            if owner != sync::thread_id() {
                self.notify.notify();
            }
        }
    }

    /// Route a mask transition to the changelist or the backend.
    fn apply_delta(&self, st: &mut BaseState, delta: MaskDelta) -> Result<()> {
        if st.changelist_enabled {
            st.changelist.record(&delta);
            Ok(())
        } else {
            st.stats.changes_applied += 1;
            self.backend()
                .apply_change(&Change::from_masks(delta.fd, delta.old, delta.new))
        }
    }

    fn ensure_signal_shim(&self, st: &mut BaseState) -> Result<()> {
        if st.sig_shim.is_some() {
            return Ok(());
        }
        let shim = SignalShim::new()?;
        let read_fd = shim.read_fd();
        st.sig_shim = Some(shim);
        let id = st.alloc_record(
            Target::Fd(read_fd),
            EventMask::READ | EventMask::PERSIST,
            0,
            Kind::SignalDrain,
            None,
            true,
        );
        if let Err(e) = self.add_nolock(st, id, None) {
            st.slab.remove(id);
            st.sig_shim = None;
            return Err(e);
        }
        st.sig_shim_ev = Some(id);
        Ok(())
    }

    fn add_nolock(
        &self,
        st: &mut BaseState,
        id: EventId,
        timeout: Option<TimeoutKind>,
    ) -> Result<()> {
        if st.slab[id].flags.contains(EventFlags::FINALIZING) {
            return Err(ReventError::EventGone);
        }
        if !st.slab[id].flags.is_inserted() {
            match st.slab[id].target {
                Target::Fd(_) => {
                    if let Some(delta) = st.io.add(&st.slab, id) {
                        if let Err(e) = self.apply_delta(st, delta) {
                            let _ = st.io.del(&st.slab, id);
                            return Err(e);
                        }
                    }
                }
                Target::Signal(sig) => {
                    self.ensure_signal_shim(st)?;
                    if st.signals.add(sig, id) {
                        let installed = match st.sig_shim.as_mut() {
                            Some(shim) => shim.install(sig),
                            None => Ok(()),
                        };
                        if let Err(e) = installed {
                            st.signals.del(sig, id);
                            return Err(e);
                        }
                    }
                    st.slab[id].flags.insert(EventFlags::SIGNAL);
                }
                Target::None => {}
            }
            let internal = st.slab[id].flags.is_internal();
            {
                let rec = &mut st.slab[id];
                rec.flags.insert(EventFlags::INSERTED);
                rec.flags.remove(EventFlags::INIT);
            }
            if !internal {
                st.event_count += 1;
            }
        }
        if let Some(kind) = timeout {
            st.slab[id].timeout = Some(kind);
            self.schedule_timeout(st, id);
        }
        self.wake_loop(st);
        Ok(())
    }

    fn del_nolock(&self, st: &mut BaseState, id: EventId) -> Result<()> {
        self.unschedule_timeout(st, id);

        // a delete stops repeat deliveries still owed to a signal event,
        // both queued and mid-delivery
        if matches!(st.slab[id].target, Target::Signal(_)) {
            st.slab[id].ncalls = 0;
            st.slab[id].calls_in_flight = 0;
        }

        if st.slab[id].flags.contains(EventFlags::ACTIVE) {
            let pri = st.slab[id].priority;
            st.queues[pri].retain(|&e| e != id);
            st.slab[id].flags.remove(EventFlags::ACTIVE);
            st.active_count -= 1;
        }
        if st.slab[id].flags.contains(EventFlags::ACTIVE_LATER) {
            st.active_later.retain(|&e| e != id);
            st.slab[id].flags.remove(EventFlags::ACTIVE_LATER);
        }
        st.slab[id].result = EventMask::empty();

        if st.slab[id].flags.is_inserted() {
            match st.slab[id].target {
                Target::Fd(_) => {
                    if let Some(delta) = st.io.del(&st.slab, id) {
                        if let Err(e) = self.apply_delta(st, delta) {
                            // the maps no longer know the event either way
                            ev_warn!("backend delete for fd {}: {}", delta.fd, e);
                        }
                    }
                }
                Target::Signal(sig) => {
                    if st.signals.del(sig, id) {
                        if let Some(shim) = st.sig_shim.as_mut() {
                            shim.restore(sig);
                        }
                    }
                }
                Target::None => {}
            }
            let internal = st.slab[id].flags.is_internal();
            st.slab[id]
                .flags
                .remove(EventFlags::INSERTED | EventFlags::SIGNAL);
            if !internal {
                st.event_count -= 1;
            }
        }
        st.slab[id].flags.insert(EventFlags::INIT);
        Ok(())
    }

    /// Schedule (or re-schedule) `id` from its stored timeout, with a
    /// fresh deadline measured from now.
    fn schedule_timeout(&self, st: &mut BaseState, id: EventId) {
        self.unschedule_timeout(st, id);
        let kind = match st.slab[id].timeout {
            Some(k) => k,
            None => return,
        };
        st.seq += 1;
        let seq = st.seq;
        match kind {
            TimeoutKind::Relative(d) => {
                let deadline = Deadline::after(d);
                {
                    let rec = &mut st.slab[id];
                    rec.deadline = deadline;
                    rec.seq = seq;
                    rec.flags.insert(EventFlags::TIMEOUT);
                }
                st.heap.push(&mut st.slab, id);
            }
            TimeoutKind::Common(b) => {
                let deadline = Deadline::after(st.common[b].duration);
                {
                    let rec = &mut st.slab[id];
                    rec.deadline = deadline;
                    rec.seq = seq;
                    rec.flags.insert(EventFlags::TIMEOUT);
                    rec.timeout_pos = TimeoutPos::Common(b);
                }
                st.common[b].queue.push_back(id);
                if st.common[b].queue.len() == 1 {
                    // the bucket was idle; its head re-enters the heap
                    // carrying this deadline
                    let head = st.common[b].head;
                    st.seq += 1;
                    let hseq = st.seq;
                    {
                        let rec = &mut st.slab[head];
                        rec.deadline = deadline;
                        rec.seq = hseq;
                    }
                    st.heap.adjust(&mut st.slab, head);
                }
            }
        }
    }

    fn unschedule_timeout(&self, st: &mut BaseState, id: EventId) {
        match st.slab[id].timeout_pos {
            TimeoutPos::None => {}
            TimeoutPos::Heap(_) => {
                st.heap.erase(&mut st.slab, id);
            }
            TimeoutPos::Common(b) => {
                let was_front = st.common[b].queue.front() == Some(&id);
                st.common[b].queue.retain(|&e| e != id);
                st.slab[id].timeout_pos = TimeoutPos::None;
                if was_front {
                    let head = st.common[b].head;
                    if let Some(&next) = st.common[b].queue.front() {
                        st.slab[head].deadline = st.slab[next].deadline;
                        st.heap.adjust(&mut st.slab, head);
                    } else {
                        st.heap.erase(&mut st.slab, head);
                    }
                }
            }
        }
        st.slab[id].flags.remove(EventFlags::TIMEOUT);
    }

    fn activate(&self, st: &mut BaseState, id: EventId, res: EventMask, ncalls: u16) {
        {
            let rec = &mut st.slab[id];
            if rec.flags.contains(EventFlags::FINALIZING) {
                return;
            }
            rec.result |= res;
            if rec.flags.contains(EventFlags::ACTIVE) {
                // already queued; signal deliveries accumulate
                if matches!(rec.target, Target::Signal(_)) {
                    rec.ncalls = rec.ncalls.saturating_add(ncalls);
                }
                return;
            }
            if rec.flags.contains(EventFlags::ACTIVE_LATER) {
                return;
            }
            rec.ncalls = ncalls.max(1);
            rec.flags.insert(EventFlags::ACTIVE);
        }
        let pri = st.slab[id].priority;
        st.queues[pri].push_back(id);
        st.active_count += 1;
        self.wake_loop(st);
    }

    fn activate_later(&self, st: &mut BaseState, id: EventId, res: EventMask) {
        {
            let rec = &mut st.slab[id];
            if rec.flags.contains(EventFlags::FINALIZING) {
                return;
            }
            rec.result |= res;
            if rec.flags.is_queued_active() {
                return;
            }
            rec.ncalls = 1;
            rec.flags.insert(EventFlags::ACTIVE_LATER);
        }
        st.active_later.push_back(id);
        self.wake_loop(st);
    }

    fn promote_active_later(&self, st: &mut BaseState) {
        while let Some(id) = st.active_later.pop_front() {
            let pri = {
                let rec = &mut st.slab[id];
                rec.flags.remove(EventFlags::ACTIVE_LATER);
                rec.flags.insert(EventFlags::ACTIVE);
                rec.priority
            };
            st.queues[pri].push_back(id);
            st.active_count += 1;
        }
    }

    /// Pop everything due off the heap into the activation queues.
    /// Bucket heads advance their list and re-enter with the next
    /// deadline instead of activating themselves.
    fn drain_timeouts(&self, st: &mut BaseState, now: Deadline) {
        loop {
            let top = match st.heap.peek() {
                Some(id) => id,
                None => break,
            };
            if !st.slab[top].deadline.is_due(now) {
                break;
            }
            let id = match st.heap.pop(&mut st.slab) {
                Some(id) => id,
                None => break,
            };
            st.slab[id].flags.remove(EventFlags::TIMEOUT);
            match st.slab[id].kind {
                Kind::CommonHead(b) => {
                    loop {
                        let front = match st.common[b].queue.front() {
                            Some(&f) => f,
                            None => break,
                        };
                        if !st.slab[front].deadline.is_due(now) {
                            break;
                        }
                        st.common[b].queue.pop_front();
                        st.slab[front].timeout_pos = TimeoutPos::None;
                        st.slab[front].flags.remove(EventFlags::TIMEOUT);
                        self.activate(st, front, EventMask::TIMEOUT, 1);
                    }
                    if let Some(&next) = st.common[b].queue.front() {
                        st.slab[id].deadline = st.slab[next].deadline;
                        st.heap.push(&mut st.slab, id);
                    }
                }
                _ => {
                    self.activate(st, id, EventMask::TIMEOUT, 1);
                }
            }
        }
    }

    /// Fully remove a record from the base and release its slot.
    fn free_record(&self, st: &mut BaseState, id: EventId) {
        let _ = self.del_nolock(st, id);
        if st.loopexit_ev == Some(id) {
            st.loopexit_ev = None;
        }
        if st.sig_shim_ev == Some(id) {
            st.sig_shim_ev = None;
        }
        st.slab.remove(id);
    }
}

// ── The base ─────────────────────────────────────────────────────────

/// A reactor instance: one backend, one timer heap, one set of maps,
/// one dispatch loop. Cheap to clone; clones share the instance.
pub struct Base {
    inner: Arc<BaseInner>,
}

impl Clone for Base {
    fn clone(&self) -> Self {
        Base {
            inner: self.inner.clone(),
        }
    }
}

impl Base {
    pub fn new() -> Result<Base> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Base> {
        revent_core::log::init();
        if config.priorities == 0 || config.priorities > MAX_PRIORITIES {
            return Err(ReventError::InvalidPriority(config.priorities));
        }
        let (info, backend) = backend::select(&config)?;
        let lock = sync::alloc_lock_for(config.threads.as_ref(), LockKind::Recursive);
        let cb_done = sync::alloc_cond_for(config.threads.as_ref());
        let notify = Notifier::create()?;
        let changelist_enabled = config.changelist
            || (!config.ignore_env && env_is_set("EVENT_EPOLL_USE_CHANGELIST"));

        let state = BaseState {
            slab: Slab::new(),
            heap: MinHeap::new(),
            common: Vec::new(),
            io: IoMap::new(),
            signals: SignalMap::new(),
            sig_shim: None,
            sig_shim_ev: None,
            changelist: Changelist::new(),
            changelist_enabled,
            queues: (0..config.priorities).map(|_| VecDeque::new()).collect(),
            active_later: VecDeque::new(),
            active_count: 0,
            event_count: 0,
            seq: 0,
            gen: 0,
            running: None,
            current: None,
            loop_break: false,
            loop_exit: false,
            loopexit_ev: None,
            stats: StatCounters::default(),
        };

        let inner = Arc::new(BaseInner {
            lock,
            cb_done,
            state: UnsafeCell::new(state),
            backend: UnsafeCell::new(backend),
            notify,
            info,
            opts: BackendOpts {
                precise_timer: config.precise_timer,
            },
        });

        // the wakeup eventfd participates as ordinary internal plumbing
        {
            let mut g = inner.lock_state();
            let nfd = inner.notify.fd();
            let id = g.alloc_record(
                Target::Fd(nfd),
                EventMask::READ | EventMask::PERSIST,
                0,
                Kind::NotifyDrain,
                None,
                true,
            );
            inner.add_nolock(&mut *g, id, None)?;
        }

        Ok(Base { inner })
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.info.name
    }

    pub fn features(&self) -> BackendFeatures {
        self.inner.info.features
    }

    pub fn priority_count(&self) -> usize {
        self.inner.lock_state().queues.len()
    }

    pub fn stats(&self) -> BaseStats {
        let g = self.inner.lock_state();
        BaseStats {
            dispatches: g.stats.dispatches,
            callbacks: g.stats.callbacks,
            changes_applied: g.stats.changes_applied,
            events: g.event_count,
            active: g.active_count,
        }
    }

    #[cfg(test)]
    fn pending_changes(&self) -> usize {
        self.inner.lock_state().changelist.len()
    }

    fn new_user_event(&self, target: Target, interest: EventMask, cb: UserCallback) -> Event {
        let mut g = self.inner.lock_state();
        let pri = g.queues.len() / 2;
        let id = g.alloc_record(target, interest, pri, Kind::User, Some(cb), false);
        let gen = g.slab[id].generation;
        drop(g);
        Event {
            base: self.inner.clone(),
            id,
            gen,
        }
    }

    /// An event watching readiness on `fd`. `mask` may combine READ,
    /// WRITE, CLOSED, PERSIST and ET.
    pub fn io_event(
        &self,
        fd: RawFd,
        mask: EventMask,
        cb: impl FnMut(i32, EventMask) + Send + 'static,
    ) -> Event {
        let interest = mask & (EventMask::IO | EventMask::PERSIST | EventMask::ET);
        self.new_user_event(Target::Fd(fd), interest, Box::new(cb))
    }

    /// A pure timer. `mask` may carry PERSIST for a periodic timer.
    pub fn timer_event(
        &self,
        mask: EventMask,
        cb: impl FnMut(i32, EventMask) + Send + 'static,
    ) -> Event {
        self.new_user_event(Target::None, mask & EventMask::PERSIST, Box::new(cb))
    }

    /// An event watching delivery of `signal`. SIGNAL interest is
    /// implied; `mask` may carry PERSIST.
    pub fn signal_event(
        &self,
        signal: i32,
        mask: EventMask,
        cb: impl FnMut(i32, EventMask) + Send + 'static,
    ) -> Event {
        let interest = EventMask::SIGNAL | (mask & EventMask::PERSIST);
        self.new_user_event(Target::Signal(signal), interest, Box::new(cb))
    }

    /// A shared bucket for events using the same relative timeout; the
    /// heap carries one entry for the whole bucket. Buckets with equal
    /// durations are reused.
    pub fn common_timeout(&self, duration: Duration) -> CommonTimeout {
        let mut g = self.inner.lock_state();
        if let Some(idx) = g.common.iter().position(|b| b.duration == duration) {
            return CommonTimeout { idx };
        }
        let idx = g.common.len();
        let head = g.alloc_record(
            Target::None,
            EventMask::empty(),
            0,
            Kind::CommonHead(idx),
            None,
            true,
        );
        g.common.push(CommonTimeoutList {
            duration,
            queue: VecDeque::new(),
            head,
        });
        CommonTimeout { idx }
    }

    /// Run the loop until no events remain, `loopbreak`, or `loopexit`.
    pub fn dispatch(&self) -> Result<()> {
        self.run(LoopFlags::empty())
    }

    /// Ask the loop to return after the current callback.
    pub fn loopbreak(&self) {
        let inner = &*self.inner;
        let mut g = inner.lock_state();
        g.loop_break = true;
        inner.wake_loop(&g);
    }

    /// Arm a one-shot that ends the loop after `after` (immediately
    /// when `None`).
    pub fn loopexit(&self, after: Option<Duration>) -> Result<()> {
        let inner = &*self.inner;
        let mut g = inner.lock_state();
        let id = match g.loopexit_ev {
            Some(id) => id,
            None => {
                // counts as a registered event, so an otherwise-empty
                // loop stays alive until the exit deadline
                let id = g.alloc_record(
                    Target::None,
                    EventMask::empty(),
                    0,
                    Kind::LoopExit,
                    None,
                    false,
                );
                g.loopexit_ev = Some(id);
                id
            }
        };
        let d = after.unwrap_or(Duration::ZERO);
        inner.add_nolock(&mut *g, id, Some(TimeoutKind::Relative(d)))
    }

    /// True if the last loop ended through `loopbreak`.
    pub fn got_break(&self) -> bool {
        self.inner.lock_state().loop_break
    }

    /// True if the last loop ended through `loopexit`.
    pub fn got_exit(&self) -> bool {
        self.inner.lock_state().loop_exit
    }

    /// Rebuild the backend in a forked child: fresh kernel queue, every
    /// inserted event re-registered, signal pipe recreated. The heap and
    /// maps carry over unchanged.
    pub fn reinit(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut g = inner.lock_state();
        if g.running.is_some() {
            return Err(ReventError::LoopRunning);
        }
        if inner.info.features.contains(BackendFeatures::REINIT_AFTER_FORK) {
            let fresh = (inner.info.init)(&inner.opts)?;
            // Safety: lock held and no loop running, so no dispatch call
            // or shared borrow of the backend is in flight.
            unsafe {
                *inner.backend.get() = fresh;
            }
        }
        // pending deltas described the pre-fork kernel table
        let _ = g.changelist.take();

        if g.sig_shim.is_some() {
            if let Some(ev) = g.sig_shim_ev.take() {
                inner.free_record(&mut *g, ev);
            }
            if let Some(shim) = g.sig_shim.as_mut() {
                shim.reinit()?;
            }
            if let Some(read_fd) = g.sig_shim.as_ref().map(|s| s.read_fd()) {
                let id = g.alloc_record(
                    Target::Fd(read_fd),
                    EventMask::READ | EventMask::PERSIST,
                    0,
                    Kind::SignalDrain,
                    None,
                    true,
                );
                inner.add_nolock(&mut *g, id, None)?;
                g.sig_shim_ev = Some(id);
            }
        }

        let entries: Vec<(RawFd, EventMask)> = g.io.entries().collect();
        for (fd, mask) in entries {
            let ch = Change::from_masks(fd, EventMask::empty(), mask);
            if let Err(e) = inner.backend().apply_change(&ch) {
                ev_warn!("re-registering fd {} after fork: {}", fd, e);
            }
        }
        Ok(())
    }

    /// Drive the loop with `flags`; see [`LoopFlags`].
    pub fn run(&self, flags: LoopFlags) -> Result<()> {
        let inner = &*self.inner;
        let mut ready: Vec<Ready> = Vec::new();

        let mut g = inner.lock_state();
        if g.running.is_some() {
            return Err(ReventError::LoopRunning);
        }
        g.running = Some(sync::thread_id());
        g.loop_break = false;
        g.loop_exit = false;

        let mut result = Ok(());
        loop {
            // flush coalesced changes
            if !g.changelist.is_empty() {
                let changes = g.changelist.take();
                g.stats.changes_applied += changes.len() as u64;
                for ch in &changes {
                    if let Err(e) = inner.backend().apply_change(ch) {
                        // the offending registration keeps its previous
                        // kernel state; everything else proceeds
                        ev_warn!("applying change for fd {}: {}", ch.fd, e);
                    }
                }
            }

            if g.loop_break || g.loop_exit {
                break;
            }

            if g.event_count == 0
                && !g.has_active()
                && !flags.contains(LoopFlags::NO_EXIT_ON_EMPTY)
            {
                ev_debug!("no registered events; leaving the loop");
                break;
            }

            let timeout = if g.has_active() || flags.contains(LoopFlags::NONBLOCK) {
                Some(Duration::ZERO)
            } else {
                g.next_deadline_duration(Deadline::now())
            };

            g.stats.dispatches += 1;
            drop(g);
            let r = inner.backend().dispatch(timeout, &mut ready);
            g = inner.lock_state();
            if let Err(e) = r {
                result = Err(e);
                break;
            }

            for rd in ready.drain(..) {
                let hits = g.io_hits(rd.fd, rd.mask);
                for (id, res) in hits {
                    inner.activate(&mut *g, id, res, 1);
                }
            }

            inner.drain_timeouts(&mut *g, Deadline::now());
            inner.promote_active_later(&mut *g);

            g = self.run_active_events(inner, g);

            if g.loop_break || g.loop_exit {
                break;
            }
            if flags.intersects(LoopFlags::ONCE | LoopFlags::NONBLOCK) {
                break;
            }
        }

        g.running = None;
        drop(g);
        result
    }

    /// Drain activation queues strictly by ascending priority, FIFO
    /// inside a level, re-scanning from priority zero after every
    /// callback. The lock is released around each user callback.
    fn run_active_events<'a>(&self, inner: &'a BaseInner, mut g: Guard<'a>) -> Guard<'a> {
        loop {
            let pri = match g.first_active_priority() {
                Some(p) => p,
                None => break,
            };
            let id = match g.queues[pri].pop_front() {
                Some(id) => id,
                None => continue,
            };
            g.slab[id].flags.remove(EventFlags::ACTIVE);
            g.active_count -= 1;

            match g.slab[id].kind {
                Kind::NotifyDrain => {
                    g.slab[id].result = EventMask::empty();
                    inner.notify.drain();
                    continue;
                }
                Kind::SignalDrain => {
                    g.slab[id].result = EventMask::empty();
                    let pairs = match g.sig_shim.as_ref() {
                        Some(shim) => shim.drain(),
                        None => Vec::new(),
                    };
                    for (sig, count) in pairs {
                        let ids = g.signals.ids(sig);
                        for sid in ids {
                            inner.activate(&mut *g, sid, EventMask::SIGNAL, count);
                        }
                    }
                    continue;
                }
                Kind::LoopExit => {
                    g.slab[id].result = EventMask::empty();
                    g.loop_exit = true;
                    // one-shot: disarm so an empty base can exit again
                    let _ = inner.del_nolock(&mut *g, id);
                    continue;
                }
                Kind::CommonHead(_) => {
                    // bucket heads are consumed in the timer drain; they
                    // never carry a callback
                    continue;
                }
                Kind::User => {}
            }

            let gen = g.slab[id].generation;
            let (arg, res, persist, timed, is_signal) = {
                let rec = &mut g.slab[id];
                let res = rec.result;
                rec.result = EventMask::empty();
                // the queued activation becomes the in-flight one; a
                // re-activation from the callback queues separately
                rec.calls_in_flight = rec.ncalls.max(1);
                rec.ncalls = 0;
                (
                    rec.target.callback_arg(),
                    res,
                    rec.interest.contains(EventMask::PERSIST),
                    rec.timeout.is_some(),
                    matches!(rec.target, Target::Signal(_)),
                )
            };
            let mut cb = match g.slab[id].callback.take() {
                Some(cb) => cb,
                None => continue,
            };

            if persist && timed {
                // the interval restarts at this firing
                inner.schedule_timeout(&mut *g, id);
            } else if !persist && !is_signal {
                // one-shot: out of the registered set before the callback
                let _ = inner.del_nolock(&mut *g, id);
            }

            g.current = Some(id);
            g.stats.callbacks += 1;

            // deliver, re-checking between repeat deliveries that nothing
            // deleted or finalized the event meanwhile
            loop {
                let go = if !g.is_live(id, gen)
                    || g.slab[id].flags.contains(EventFlags::FINALIZING)
                {
                    false
                } else {
                    let rec = &mut g.slab[id];
                    if rec.calls_in_flight == 0 {
                        false
                    } else {
                        rec.calls_in_flight -= 1;
                        true
                    }
                };
                if !go {
                    break;
                }
                drop(g);
                cb(arg, res);
                g = inner.lock_state();
                if g.loop_break && g.is_live(id, gen) {
                    // finish this callback, skip its remaining repeats
                    g.slab[id].calls_in_flight = 0;
                }
            }

            g.current = None;
            inner.cb_done.signal(true);

            if g.is_live(id, gen) {
                if g.slab[id].callback.is_none() {
                    g.slab[id].callback = Some(cb);
                }
                if g.slab[id].pending_free {
                    // the handle went away mid-callback
                    inner.free_record(&mut *g, id);
                } else if g.slab[id].flags.contains(EventFlags::FINALIZING)
                    && g.slab[id].finalizer.is_some()
                {
                    let fin = match g.slab[id].finalizer.take() {
                        Some(f) => f,
                        None => continue,
                    };
                    drop(g);
                    fin(arg);
                    g = inner.lock_state();
                    if g.is_live(id, gen) {
                        g.slab.remove(id);
                    }
                } else if !persist && is_signal && g.slab[id].flags.is_inserted() {
                    // one-shot signal events leave the registered set
                    // once their deliveries ran
                    let _ = inner.del_nolock(&mut *g, id);
                }
            }

            if g.loop_break {
                break;
            }
        }
        g
    }
}

// ── The event handle ─────────────────────────────────────────────────

/// Caller-held handle to one registered interest. Dropping it deletes
/// the registration (deferred while its callback is mid-flight).
pub struct Event {
    base: Arc<BaseInner>,
    id: EventId,
    gen: u64,
}

impl Event {
    /// Register the event, optionally scheduling a relative timeout.
    /// Re-adding an already registered event just (re)schedules.
    pub fn add(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return Err(ReventError::EventGone);
        }
        inner.add_nolock(&mut *g, self.id, timeout.map(TimeoutKind::Relative))
    }

    /// Register with a shared-bucket timeout from
    /// [`Base::common_timeout`].
    pub fn add_common(&self, timeout: CommonTimeout) -> Result<()> {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return Err(ReventError::EventGone);
        }
        if timeout.idx >= g.common.len() {
            return Err(ReventError::UnknownCommonTimeout);
        }
        inner.add_nolock(&mut *g, self.id, Some(TimeoutKind::Common(timeout.idx)))
    }

    /// Unregister. Blocks until a callback running on another thread
    /// has returned; deleting an event that is not registered succeeds.
    pub fn del(&self) -> Result<()> {
        self.del_impl(true)
    }

    /// Unregister without waiting for an in-flight callback.
    pub fn del_noblock(&self) -> Result<()> {
        self.del_impl(false)
    }

    fn del_impl(&self, block: bool) -> Result<()> {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return Ok(());
        }
        inner.del_nolock(&mut *g, self.id)?;
        if block {
            while g.current == Some(self.id) && g.running != Some(sync::thread_id()) {
                inner.cb_done.wait(&*inner.lock, None);
            }
        }
        drop(g);
        Ok(())
    }

    /// Queue the event as if `mask` fired, running the callback
    /// `ncalls` times (at least once).
    pub fn active(&self, mask: EventMask, ncalls: u16) {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return;
        }
        inner.activate(&mut *g, self.id, mask, ncalls);
    }

    /// Like [`Event::active`], but deferred to the start of the next
    /// dispatch pass.
    pub fn active_later(&self, mask: EventMask) {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return;
        }
        inner.activate_later(&mut *g, self.id, mask);
    }

    /// Which of `mask` the event is currently registered or queued for.
    /// TIMEOUT reports a scheduled deadline.
    pub fn pending(&self, mask: EventMask) -> EventMask {
        let inner = &*self.base;
        let g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return EventMask::empty();
        }
        let rec = &g.slab[self.id];
        let mut out = EventMask::empty();
        if rec.flags.is_inserted() {
            out |= rec.interest & (EventMask::IO | EventMask::SIGNAL);
        }
        if rec.flags.contains(EventFlags::TIMEOUT) {
            out |= EventMask::TIMEOUT;
        }
        if rec.flags.is_queued_active() {
            out |= rec.result;
        }
        out & mask
    }

    /// Move the event to another priority level. Refused while the
    /// event sits in an activation queue.
    pub fn set_priority(&self, priority: usize) -> Result<()> {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return Err(ReventError::EventGone);
        }
        if priority >= g.queues.len() {
            return Err(ReventError::InvalidPriority(priority));
        }
        if g.slab[self.id].flags.is_queued_active() {
            return Err(ReventError::EventActive);
        }
        g.slab[self.id].priority = priority;
        Ok(())
    }

    /// Deferred destruction: unregister, guarantee no further callback
    /// invocation, and run `finalizer` exactly once after any in-flight
    /// callback has completed.
    pub fn finalize(self, finalizer: impl FnOnce(i32) + Send + 'static) {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return;
        }
        let _ = inner.del_nolock(&mut *g, self.id);
        g.slab[self.id].flags.insert(EventFlags::FINALIZING);
        g.slab[self.id].finalizer = Some(Box::new(finalizer));
        if g.current != Some(self.id) {
            let arg = g.slab[self.id].target.callback_arg();
            let fin = match g.slab[self.id].finalizer.take() {
                Some(f) => f,
                None => return,
            };
            g.slab.remove(self.id);
            drop(g);
            fin(arg);
        }
        // otherwise the driver runs the finalizer when the in-flight
        // callback returns; Drop below sees FINALIZING and stands down
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let inner = &*self.base;
        let mut g = inner.lock_state();
        if !g.is_live(self.id, self.gen) {
            return;
        }
        if g.slab[self.id].flags.contains(EventFlags::FINALIZING) {
            return;
        }
        if g.current == Some(self.id) && g.running != Some(sync::thread_id()) {
            let _ = inner.del_nolock(&mut *g, self.id);
            g.slab[self.id].pending_free = true;
        } else {
            inner.free_record(&mut *g, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn send_bytes(fd: RawFd, n: usize) {
        let buf = vec![0x2au8; n];
        let r = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, n) };
        assert_eq!(r, n as isize);
    }

    fn drain_fd(fd: RawFd) {
        let mut buf = [0u8; 64];
        loop {
            let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if r <= 0 {
                break;
            }
        }
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_empty_base_returns_immediately() {
        let base = Base::new().unwrap();
        let start = Instant::now();
        base.dispatch().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!base.got_break());
        assert!(!base.got_exit());
    }

    #[test]
    fn test_timer_ordering() {
        let base = Base::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut events = Vec::new();
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            let ev = base.timer_event(EventMask::empty(), move |arg, res| {
                assert_eq!(arg, -1);
                assert!(res.contains(EventMask::TIMEOUT));
                order.lock().unwrap().push(ms);
            });
            ev.add(Some(Duration::from_millis(ms))).unwrap();
            events.push(ev);
        }

        let start = Instant::now();
        base.dispatch().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(28));
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_persistent_read_fires_per_write() {
        let base = Base::new().unwrap();
        let (r, w) = socketpair();
        let count = Arc::new(AtomicUsize::new(0));
        let masks = Arc::new(Mutex::new(Vec::new()));

        let b2 = base.clone();
        let c2 = count.clone();
        let m2 = masks.clone();
        let ev = base.io_event(r, EventMask::READ | EventMask::PERSIST, move |fd, res| {
            m2.lock().unwrap().push(res);
            drain_fd(fd);
            let n = c2.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                send_bytes(w, 3);
            } else {
                b2.loopbreak();
            }
        });
        ev.add(None).unwrap();
        send_bytes(w, 3);

        base.dispatch().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        let masks = masks.lock().unwrap();
        for m in masks.iter() {
            assert!(m.contains(EventMask::READ));
            assert!(!m.contains(EventMask::TIMEOUT));
        }
        drop(ev);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_changelist_coalesces_add_del_add() {
        let base = Base::with_config(Config::default().changelist(true).ignore_env(true)).unwrap();
        // flush construction-time plumbing changes
        base.loopexit(Some(Duration::ZERO)).unwrap();
        base.run(LoopFlags::empty()).unwrap();
        assert_eq!(base.pending_changes(), 0);

        let (r, w) = socketpair();
        let fired = Arc::new(AtomicUsize::new(0));

        let er = base.io_event(r, EventMask::READ, |_, _| {});
        let f2 = fired.clone();
        let ew = base.io_event(r, EventMask::WRITE, move |_, res| {
            assert!(res.contains(EventMask::WRITE));
            f2.fetch_add(1, Ordering::SeqCst);
        });

        er.add(None).unwrap();
        er.del().unwrap();
        ew.add(None).unwrap();
        // three operations on one fd, one pending slot
        assert_eq!(base.pending_changes(), 1);

        let before = base.stats().changes_applied;
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(base.stats().changes_applied, before + 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(er);
        drop(ew);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_readd_after_del_equals_plain_add() {
        let base = Base::with_config(Config::default().changelist(true).ignore_env(true)).unwrap();
        base.loopexit(Some(Duration::ZERO)).unwrap();
        base.run(LoopFlags::empty()).unwrap();

        let (r, w) = socketpair();
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let b2 = base.clone();
        let ev = base.io_event(r, EventMask::READ | EventMask::PERSIST, move |fd, _| {
            drain_fd(fd);
            f2.fetch_add(1, Ordering::SeqCst);
            b2.loopbreak();
        });

        // add; del; add again: the backend sees one coalesced change
        ev.add(None).unwrap();
        ev.del().unwrap();
        ev.add(None).unwrap();
        assert_eq!(base.pending_changes(), 1);

        send_bytes(w, 1);
        base.dispatch().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(ev);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_priority_order_with_fresh_high_priority_event() {
        let base =
            Base::with_config(Config::default().priorities(6).ignore_env(true)).unwrap();
        let (r, w) = socketpair();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let child: Arc<Mutex<Option<Event>>> = Arc::new(Mutex::new(None));

        let b2 = base.clone();
        let o2 = order.clone();
        let ch2 = child.clone();
        let high = base.io_event(r, EventMask::READ, move |_, _| {
            o2.lock().unwrap().push("p0");
            let o3 = o2.clone();
            let fresh = b2.timer_event(EventMask::empty(), move |_, _| {
                o3.lock().unwrap().push("p0-child");
            });
            fresh.set_priority(0).unwrap();
            fresh.active(EventMask::READ, 1);
            *ch2.lock().unwrap() = Some(fresh);
        });
        high.set_priority(0).unwrap();

        let o4 = order.clone();
        let low = base.io_event(r, EventMask::READ, move |fd, _| {
            o4.lock().unwrap().push("p5");
            drain_fd(fd);
        });
        low.set_priority(5).unwrap();

        high.add(None).unwrap();
        low.add(None).unwrap();
        send_bytes(w, 1);

        base.dispatch().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["p0", "p0-child", "p5"]);

        drop(high);
        drop(low);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_signal_fires_once_per_raise() {
        let _g = crate::signal::test_guard().lock().unwrap();
        // park the disposition on ignore so post-restore raises are inert
        unsafe {
            let mut ign: libc::sigaction = std::mem::zeroed();
            ign.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut ign.sa_mask);
            libc::sigaction(libc::SIGUSR1, &ign, std::ptr::null_mut());
        }

        let base = Base::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let b2 = base.clone();
        let c2 = count.clone();
        let ev = base.signal_event(libc::SIGUSR1, EventMask::PERSIST, move |sig, res| {
            assert_eq!(sig, libc::SIGUSR1);
            assert!(res.contains(EventMask::SIGNAL));
            c2.fetch_add(1, Ordering::SeqCst);
            b2.loopbreak();
        });
        ev.add(None).unwrap();

        let t = thread::spawn(|| {
            thread::sleep(Duration::from_millis(50));
            unsafe { libc::raise(libc::SIGUSR1) };
        });

        base.dispatch().unwrap();
        t.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // delete restores the saved disposition; a further raise cannot
        // reach the callback
        ev.del().unwrap();
        unsafe { libc::raise(libc::SIGUSR1) };
        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_active_runs_ncalls_times() {
        let base = Base::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let ev = base.timer_event(EventMask::empty(), move |_, res| {
            assert!(res.contains(EventMask::READ));
            c2.fetch_add(1, Ordering::SeqCst);
        });
        ev.active(EventMask::READ, 3);
        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let base = Base::new().unwrap();
        let ev = base.timer_event(EventMask::empty(), |_, _| {});
        // never added: still success
        ev.del().unwrap();
        ev.add(Some(Duration::from_secs(3600))).unwrap();
        ev.del().unwrap();
        ev.del().unwrap();
        ev.del_noblock().unwrap();
    }

    #[test]
    fn test_pending_reports_masks() {
        let base = Base::new().unwrap();
        let (r, w) = socketpair();
        let ev = base.io_event(r, EventMask::READ | EventMask::PERSIST, |_, _| {});
        assert_eq!(ev.pending(EventMask::all()), EventMask::empty());

        ev.add(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(ev.pending(EventMask::READ), EventMask::READ);
        assert_eq!(
            ev.pending(EventMask::TIMEOUT | EventMask::WRITE),
            EventMask::TIMEOUT
        );

        ev.del().unwrap();
        assert_eq!(ev.pending(EventMask::all()), EventMask::empty());
        drop(ev);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_loopexit_ends_periodic_dispatch() {
        let base = Base::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let tick = base.timer_event(EventMask::PERSIST, move |_, _| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        tick.add(Some(Duration::from_millis(5))).unwrap();
        base.loopexit(Some(Duration::from_millis(60))).unwrap();

        base.dispatch().unwrap();
        assert!(base.got_exit());
        assert!(!base.got_break());
        let n = count.load(Ordering::SeqCst);
        assert!(n >= 2, "periodic timer fired {} times", n);
        drop(tick);
    }

    #[test]
    fn test_common_timeout_bucket_fires_in_order() {
        let base = Base::new().unwrap();
        let ct = base.common_timeout(Duration::from_millis(30));
        // equal durations share a bucket
        let again = base.common_timeout(Duration::from_millis(30));
        assert_eq!(ct.idx, again.idx);

        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        let e1 = base.timer_event(EventMask::empty(), move |_, res| {
            assert!(res.contains(EventMask::TIMEOUT));
            o1.lock().unwrap().push(1);
        });
        let o2 = order.clone();
        let e2 = base.timer_event(EventMask::empty(), move |_, _| {
            o2.lock().unwrap().push(2);
        });
        let e3 = base.timer_event(EventMask::empty(), |_, _| {
            panic!("cancelled event fired");
        });

        e1.add_common(ct).unwrap();
        thread::sleep(Duration::from_millis(15));
        e2.add_common(ct).unwrap();
        e3.add_common(ct).unwrap();
        e3.del().unwrap();

        let start = Instant::now();
        base.dispatch().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        drop(e1);
        drop(e2);
        drop(e3);
    }

    #[test]
    fn test_once_returns_after_pass_without_callbacks() {
        let base = Base::new().unwrap();
        // neither timer comes due; the only wakeup is the notifier
        let park = base.timer_event(EventMask::empty(), |_, _| {
            panic!("timer not due");
        });
        park.add(Some(Duration::from_secs(30))).unwrap();

        let b2 = base.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            // a cross-thread add cuts the wait short without queuing
            // any user callback
            let far = b2.timer_event(EventMask::empty(), |_, _| {});
            far.add(Some(Duration::from_secs(30))).unwrap();
            thread::sleep(Duration::from_millis(200));
            drop(far);
        });

        let start = Instant::now();
        base.run(LoopFlags::ONCE).unwrap();
        // one pass, zero callbacks, still returns
        assert!(start.elapsed() < Duration::from_secs(10));
        t.join().unwrap();
        drop(park);
    }

    #[test]
    fn test_cross_thread_add_wakes_blocked_loop() {
        let base = Base::new().unwrap();
        let hit = Arc::new(AtomicBool::new(false));

        // a far-off timer keeps the loop blocked
        let park = base.timer_event(EventMask::empty(), |_, _| {});
        park.add(Some(Duration::from_secs(30))).unwrap();

        let b2 = base.clone();
        let h2 = hit.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let b3 = b2.clone();
            let h3 = h2.clone();
            let ev = b2.timer_event(EventMask::empty(), move |_, _| {
                h3.store(true, Ordering::SeqCst);
                b3.loopbreak();
            });
            ev.add(Some(Duration::from_millis(5))).unwrap();
            // keep the handle alive until well past the deadline
            thread::sleep(Duration::from_millis(300));
            drop(ev);
        });

        let start = Instant::now();
        base.dispatch().unwrap();
        t.join().unwrap();
        assert!(hit.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_secs(10));
        drop(park);
    }

    #[test]
    fn test_finalize_runs_exactly_once_and_stops_callbacks() {
        let base = Base::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));

        let f2 = fired.clone();
        let ev = base.timer_event(EventMask::PERSIST, move |_, _| {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        ev.add(Some(Duration::from_millis(2))).unwrap();

        let b2 = base.clone();
        let loop_thread = thread::spawn(move || {
            b2.run(LoopFlags::NO_EXIT_ON_EMPTY).unwrap();
        });

        thread::sleep(Duration::from_millis(30));
        let fin2 = finalized.clone();
        ev.finalize(move |_| {
            fin2.fetch_add(1, Ordering::SeqCst);
        });
        let after = fired.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(50));
        // at most the in-flight invocation may still land
        assert!(fired.load(Ordering::SeqCst) <= after + 1);

        base.loopbreak();
        loop_thread.join().unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_handle_unregisters() {
        let base = Base::new().unwrap();
        {
            let ev = base.timer_event(EventMask::empty(), |_, _| {
                panic!("dropped event fired");
            });
            ev.add(Some(Duration::from_secs(30))).unwrap();
            assert_eq!(base.stats().events, 1);
        }
        assert_eq!(base.stats().events, 0);
        let start = Instant::now();
        base.dispatch().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_second_loop_is_refused() {
        let base = Base::new().unwrap();
        let entered = Arc::new(AtomicBool::new(false));

        let b2 = base.clone();
        let e2 = entered.clone();
        let park = base.timer_event(EventMask::empty(), |_, _| {});
        park.add(Some(Duration::from_secs(30))).unwrap();

        let t = thread::spawn(move || {
            e2.store(true, Ordering::SeqCst);
            b2.run(LoopFlags::empty())
        });
        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(50));

        assert!(matches!(
            base.run(LoopFlags::NONBLOCK),
            Err(ReventError::LoopRunning)
        ));

        base.loopbreak();
        t.join().unwrap().unwrap();
        drop(park);
    }

    #[test]
    fn test_reinit_reregisters_fds() {
        let base = Base::new().unwrap();
        let (r, w) = socketpair();
        let count = Arc::new(AtomicUsize::new(0));
        let b2 = base.clone();
        let c2 = count.clone();
        let ev = base.io_event(r, EventMask::READ | EventMask::PERSIST, move |fd, _| {
            drain_fd(fd);
            c2.fetch_add(1, Ordering::SeqCst);
            b2.loopbreak();
        });
        ev.add(None).unwrap();

        // as after a fork: fresh backend instance, same registrations
        base.reinit().unwrap();

        send_bytes(w, 1);
        base.dispatch().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(ev);
        close_fd(r);
        close_fd(w);
    }
}
