//! Edge-triggered epoll backend
//!
//! Translates coalesced changes into `epoll_ctl` calls through a
//! precomputed table and recovers from the races a level of indirection
//! over fds invites: an fd closed and reopened behind our back turns a
//! MOD into an ADD, a dup()-aliased registration turns an ADD into a
//! MOD, and a DEL on an already-closed fd is no failure at all.
//!
//! With precise timers requested, a monotonic timerfd carries the
//! next-deadline interval so waits keep microsecond resolution;
//! otherwise timeouts round up to milliseconds and clamp below the
//! historical kernel overflow bound.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::time::Duration;

use revent_core::{ev_debug, ev_warn, EventMask, ReventError, Result};

use super::{Backend, BackendFeatures, BackendInfo, BackendOpts, Ready};
use crate::changelist::Change;
use crate::last_errno;
use crate::time::duration_to_msec_ceil;

const INITIAL_NEVENT: usize = 32;
const MAX_NEVENT: usize = 4096;

/// Kernels up to at least 2.6.24 overflow on epoll timeouts beyond
/// roughly 35.8 minutes; stay under it.
const MAX_EPOLL_TIMEOUT_MS: i64 = 35 * 60 * 1000;

// ── Translation table ────────────────────────────────────────────────
//
// Indexed by the three old-mask bits and the three new-mask bits
// (read, write, close), 64 combinations total, so the hot path is one
// load and no branching on the transition shape.

const RD: u8 = 1;
const WR: u8 = 2;
const CL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtlOp {
    NoOp,
    Add,
    Mod,
    Del,
}

#[derive(Clone, Copy)]
struct OpEntry {
    op: CtlOp,
    events: u32,
}

const fn ep_events(bits: u8) -> u32 {
    let mut e = 0u32;
    if bits & RD != 0 {
        e |= libc::EPOLLIN as u32;
    }
    if bits & WR != 0 {
        e |= libc::EPOLLOUT as u32;
    }
    if bits & CL != 0 {
        e |= libc::EPOLLRDHUP as u32;
    }
    e
}

const fn op_entry(old: u8, new: u8) -> OpEntry {
    if new == old {
        OpEntry {
            op: CtlOp::NoOp,
            events: 0,
        }
    } else if old == 0 {
        OpEntry {
            op: CtlOp::Add,
            events: ep_events(new),
        }
    } else if new == 0 {
        OpEntry {
            op: CtlOp::Del,
            events: ep_events(old),
        }
    } else {
        OpEntry {
            op: CtlOp::Mod,
            events: ep_events(new),
        }
    }
}

const fn build_op_table() -> [OpEntry; 64] {
    let mut table = [OpEntry {
        op: CtlOp::NoOp,
        events: 0,
    }; 64];
    let mut i = 0;
    while i < 64 {
        table[i] = op_entry((i >> 3) as u8, (i & 7) as u8);
        i += 1;
    }
    table
}

static EPOLL_OP_TABLE: [OpEntry; 64] = build_op_table();

#[inline]
fn mask_bits(m: EventMask) -> u8 {
    let mut b = 0u8;
    if m.contains(EventMask::READ) {
        b |= RD;
    }
    if m.contains(EventMask::WRITE) {
        b |= WR;
    }
    if m.contains(EventMask::CLOSED) {
        b |= CL;
    }
    b
}

#[inline]
fn table_index(old: u8, new: u8) -> usize {
    (((old & 7) as usize) << 3) | (new & 7) as usize
}

fn op_name(op: CtlOp) -> &'static str {
    match op {
        CtlOp::NoOp => "NONE",
        CtlOp::Add => "ADD",
        CtlOp::Mod => "MOD",
        CtlOp::Del => "DEL",
    }
}

// ── Backend ──────────────────────────────────────────────────────────

struct WaitBuf {
    events: Vec<libc::epoll_event>,
}

pub(crate) struct EpollBackend {
    epfd: RawFd,
    /// Monotonic timerfd for microsecond waits; -1 when unavailable or
    /// not requested.
    timerfd: RawFd,
    /// Only the dispatching thread touches this.
    wait: UnsafeCell<WaitBuf>,
}

// Safety: `wait` is confined to the single thread the base allows to
// call `dispatch`; everything else is an fd used via syscalls.
unsafe impl Send for EpollBackend {}
unsafe impl Sync for EpollBackend {}

fn zeroed_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

fn epoll_init(opts: &BackendOpts) -> Result<Box<dyn Backend>> {
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        return Err(ReventError::Os(last_errno()));
    }

    let mut timerfd = -1;
    if opts.precise_timer {
        // epoll itself is millisecond-grained; a monotonic timerfd in the
        // interest set restores fine-grained wakeups
        timerfd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timerfd >= 0 {
            let mut epev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: timerfd as u64,
            };
            if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, timerfd, &mut epev) } < 0 {
                ev_warn!("epoll_ctl(timerfd): errno {}", last_errno());
                unsafe { libc::close(timerfd) };
                timerfd = -1;
            }
        } else {
            let errno = last_errno();
            if errno != libc::EINVAL && errno != libc::ENOSYS {
                ev_warn!("timerfd_create: errno {}", errno);
            }
        }
    }

    Ok(Box::new(EpollBackend {
        epfd,
        timerfd,
        wait: UnsafeCell::new(WaitBuf {
            events: vec![zeroed_event(); INITIAL_NEVENT],
        }),
    }))
}

pub(crate) const INFO: BackendInfo = BackendInfo {
    name: "epoll",
    features: BackendFeatures::ET
        .union(BackendFeatures::O1)
        .union(BackendFeatures::EARLY_CLOSE)
        .union(BackendFeatures::REINIT_AFTER_FORK),
    init: epoll_init,
};

impl EpollBackend {
    fn ctl(&self, op: CtlOp, fd: RawFd, events: u32) -> i32 {
        let raw = match op {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Mod => libc::EPOLL_CTL_MOD,
            CtlOp::Del => libc::EPOLL_CTL_DEL,
            CtlOp::NoOp => return 0,
        };
        let mut epev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe { libc::epoll_ctl(self.epfd, raw, fd, &mut epev) }
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn features(&self) -> BackendFeatures {
        INFO.features
    }

    fn apply_change(&self, ch: &Change) -> Result<()> {
        let old = mask_bits(ch.old_mask);
        let new = mask_bits(ch.new_mask());
        let ent = EPOLL_OP_TABLE[table_index(old, new)];
        if ent.op == CtlOp::NoOp {
            return Ok(());
        }

        let mut events = ent.events;
        if ch.et {
            events |= libc::EPOLLET as u32;
        }

        if self.ctl(ent.op, ch.fd, events) == 0 {
            ev_debug!(
                "epoll {}({:#x}) on fd {} ok",
                op_name(ent.op),
                events,
                ch.fd
            );
            return Ok(());
        }

        let errno = last_errno();
        match ent.op {
            CtlOp::Mod if errno == libc::ENOENT => {
                // the fd was closed and reopened between dispatches, so
                // the kernel entry we meant to modify is gone
                if self.ctl(CtlOp::Add, ch.fd, events) == 0 {
                    ev_debug!("epoll MOD({:#x}) on fd {} retried as ADD", events, ch.fd);
                    Ok(())
                } else {
                    ev_warn!(
                        "epoll MOD({:#x}) on fd {} retried as ADD; that failed too: errno {}",
                        events,
                        ch.fd,
                        last_errno()
                    );
                    Err(ReventError::BackendChange {
                        fd: ch.fd,
                        errno: last_errno(),
                    })
                }
            }
            CtlOp::Add if errno == libc::EEXIST => {
                // either a redundant precautionary add, or dup() handed
                // the same kernel entry to two fds; assumes the kernel
                // reports the alias as EEXIST, in which case MOD updates
                // the shared entry
                if self.ctl(CtlOp::Mod, ch.fd, events) == 0 {
                    ev_debug!("epoll ADD({:#x}) on fd {} retried as MOD", events, ch.fd);
                    Ok(())
                } else {
                    ev_warn!(
                        "epoll ADD({:#x}) on fd {} retried as MOD; that failed too: errno {}",
                        events,
                        ch.fd,
                        last_errno()
                    );
                    Err(ReventError::BackendChange {
                        fd: ch.fd,
                        errno: last_errno(),
                    })
                }
            }
            CtlOp::Del
                if errno == libc::ENOENT || errno == libc::EBADF || errno == libc::EPERM =>
            {
                // the fd was closed before we got here; nothing to delete
                ev_debug!("epoll DEL on fd {} unnecessary (errno {})", ch.fd, errno);
                Ok(())
            }
            _ => {
                ev_warn!(
                    "epoll {}({:#x}) on fd {} failed: errno {}",
                    op_name(ent.op),
                    events,
                    ch.fd,
                    errno
                );
                Err(ReventError::BackendChange { fd: ch.fd, errno })
            }
        }
    }

    fn dispatch(&self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> Result<()> {
        // Safety: dispatch is single-threaded by the base's contract.
        let buf = unsafe { &mut *self.wait.get() };

        let mut timeout_ms: i32 = -1;
        if self.timerfd >= 0 {
            let mut its: libc::itimerspec = unsafe { std::mem::zeroed() };
            match timeout {
                // zero it_value disarms the timer; block on fds alone
                None => {}
                Some(tv) if tv.is_zero() => {
                    // timerfd can't fire "now"; poll instead
                    timeout_ms = 0;
                }
                Some(tv) => {
                    its.it_value.tv_sec = tv.as_secs() as libc::time_t;
                    its.it_value.tv_nsec = tv.subsec_nanos() as libc::c_long;
                }
            }
            if unsafe { libc::timerfd_settime(self.timerfd, 0, &its, std::ptr::null_mut()) } < 0 {
                ev_warn!("timerfd_settime: errno {}", last_errno());
            }
        } else if let Some(tv) = timeout {
            let ms = duration_to_msec_ceil(tv);
            timeout_ms = ms.min(MAX_EPOLL_TIMEOUT_MS) as i32;
        }

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.events.as_mut_ptr(),
                buf.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                // a signal cut the wait short: no events, keep looping
                return Ok(());
            }
            ev_warn!("epoll_wait: errno {}", errno);
            return Err(ReventError::Os(errno));
        }

        let n = n as usize;
        for i in 0..n {
            let what = buf.events[i].events;
            let fd = buf.events[i].u64 as RawFd;
            if self.timerfd >= 0 && fd == self.timerfd {
                // just a wakeup; the driver reads the clock itself
                continue;
            }

            let mut mask = EventMask::empty();
            if what & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                // error or hangup: both halves get to observe it
                mask = EventMask::READ | EventMask::WRITE;
            } else {
                if what & libc::EPOLLIN as u32 != 0 {
                    mask |= EventMask::READ;
                }
                if what & libc::EPOLLOUT as u32 != 0 {
                    mask |= EventMask::WRITE;
                }
                if what & libc::EPOLLRDHUP as u32 != 0 {
                    mask |= EventMask::CLOSED;
                }
            }
            if mask.is_empty() {
                continue;
            }
            // ET rides along unconditionally; the map hands it only to
            // events that asked for edge semantics
            ready.push(Ready {
                fd,
                mask: mask | EventMask::ET,
            });
        }

        if n == buf.events.len() && buf.events.len() < MAX_NEVENT {
            // the buffer filled; be ready for more next time
            let newlen = buf.events.len() * 2;
            buf.events.resize(newlen, zeroed_event());
        }

        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
        }
        if self.timerfd >= 0 {
            unsafe { libc::close(self.timerfd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revent_core::EventMask as M;

    const R: EventMask = M::READ;
    const W: EventMask = M::WRITE;

    fn apply(backend: &dyn Backend, fd: RawFd, old: EventMask, new: EventMask) -> Result<()> {
        backend.apply_change(&Change::from_masks(fd, old, new))
    }

    fn new_backend() -> Box<dyn Backend> {
        epoll_init(&BackendOpts::default()).unwrap()
    }

    fn pipe_nonblock() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_op_table_shapes() {
        // no registration, no interest: nothing to do
        let e = EPOLL_OP_TABLE[table_index(0, 0)];
        assert_eq!(e.op, CtlOp::NoOp);

        // fresh interest: ADD with the new set
        let e = EPOLL_OP_TABLE[table_index(0, RD)];
        assert_eq!(e.op, CtlOp::Add);
        assert_eq!(e.events, libc::EPOLLIN as u32);

        // widened interest: MOD with the full new set
        let e = EPOLL_OP_TABLE[table_index(RD, RD | WR)];
        assert_eq!(e.op, CtlOp::Mod);
        assert_eq!(e.events, (libc::EPOLLIN | libc::EPOLLOUT) as u32);

        // interest withdrawn entirely: DEL
        let e = EPOLL_OP_TABLE[table_index(WR, 0)];
        assert_eq!(e.op, CtlOp::Del);
        assert_eq!(e.events, libc::EPOLLOUT as u32);

        // unchanged interest: no syscall
        let e = EPOLL_OP_TABLE[table_index(RD | CL, RD | CL)];
        assert_eq!(e.op, CtlOp::NoOp);

        // close-monitoring maps to RDHUP
        let e = EPOLL_OP_TABLE[table_index(0, CL)];
        assert_eq!(e.op, CtlOp::Add);
        assert_eq!(e.events, libc::EPOLLRDHUP as u32);
    }

    #[test]
    fn test_register_and_poll_readiness() {
        let backend = new_backend();
        let (r, w) = pipe_nonblock();

        apply(&*backend, r, M::empty(), R).unwrap();

        // nothing written yet: a poll comes back empty
        let mut ready = Vec::new();
        backend.dispatch(Some(Duration::ZERO), &mut ready).unwrap();
        assert!(ready.iter().all(|rd| rd.fd != r));

        let buf = [1u8; 3];
        let n = unsafe { libc::write(w, buf.as_ptr() as *const libc::c_void, 3) };
        assert_eq!(n, 3);

        ready.clear();
        backend
            .dispatch(Some(Duration::from_millis(500)), &mut ready)
            .unwrap();
        let hit = ready.iter().find(|rd| rd.fd == r).expect("readable fd");
        assert!(hit.mask.contains(M::READ));

        apply(&*backend, r, R, M::empty()).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_del_after_close_is_success() {
        let backend = new_backend();
        let (r, w) = pipe_nonblock();
        apply(&*backend, r, M::empty(), R).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
        // the close already removed the kernel entry
        apply(&*backend, r, R, M::empty()).unwrap();
    }

    #[test]
    fn test_mod_enoent_recovers_as_add() {
        let backend = new_backend();

        let (r1, w1) = pipe_nonblock();
        apply(&*backend, r1, M::empty(), R).unwrap();

        // close r1 and make the same fd number refer to a different pipe,
        // without telling the backend
        let (r2, w2) = pipe_nonblock();
        let rc = unsafe { libc::dup2(r2, r1) };
        assert_eq!(rc, r1);

        // MOD hits ENOENT (the old entry died with the old file) and is
        // retried as ADD
        apply(&*backend, r1, R, R | W).unwrap();

        let buf = [7u8; 1];
        assert_eq!(
            unsafe { libc::write(w2, buf.as_ptr() as *const libc::c_void, 1) },
            1
        );
        let mut ready = Vec::new();
        backend
            .dispatch(Some(Duration::from_millis(500)), &mut ready)
            .unwrap();
        let hit = ready.iter().find(|rd| rd.fd == r1).expect("readable fd");
        assert!(hit.mask.contains(M::READ));

        unsafe {
            libc::close(r1);
            libc::close(w1);
            libc::close(r2);
            libc::close(w2);
        }
    }

    #[test]
    fn test_add_eexist_recovers_as_mod() {
        let backend = new_backend();
        let (r, w) = pipe_nonblock();

        apply(&*backend, r, M::empty(), R).unwrap();
        // claim the backend knows nothing and add again: EEXIST, retried
        // as MOD
        apply(&*backend, r, M::empty(), R | W).unwrap();

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_precise_timer_creates_timerfd() {
        let backend = epoll_init(&BackendOpts { precise_timer: true }).unwrap();
        // a short precise wait returns without readiness
        let mut ready = Vec::new();
        let start = std::time::Instant::now();
        backend
            .dispatch(Some(Duration::from_millis(5)), &mut ready)
            .unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(4));
    }
}
