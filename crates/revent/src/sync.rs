//! Threading shim
//!
//! Every base owns one recursive lock protecting its heap, maps,
//! changelist, activation queues and event flags, plus one condition used
//! by blocking delete and the finalization handshake. Both come from a
//! pluggable provider so embedders with their own locking regime can
//! inject it; the process-wide default is [`StdThreads`].
//!
//! The provider must be chosen before the first lock is handed out.
//! After that the table is frozen: some thread may already be inside a
//! lock built from the old callbacks, so swapping them would be unsound.
//!
//! A debug wrapper can be layered over any provider to verify the locking
//! contract: no double-acquire of a non-recursive lock, every unlock
//! matched to a lock by the same thread, and condition waits entered only
//! while holding the paired lock. Violations abort the process; they mean
//! undefined behavior is already in play.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use revent_core::{ev_fatal, ev_warn, ReventError, Result};

/// Lock flavors a provider can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// May only be acquired once; re-acquiring from the owning thread is
    /// a contract violation.
    Plain,
    /// May be re-acquired by the owning thread; released when unlock
    /// count matches lock count.
    Recursive,
}

/// A lock as the reactor sees it.
pub trait RawLock: Send + Sync {
    fn lock(&self);
    fn try_lock(&self) -> bool;
    fn unlock(&self);

    /// Debug hook: does the calling thread hold this lock? Providers
    /// that cannot tell answer `true`.
    fn held_by_current(&self) -> bool {
        true
    }
}

/// A condition usable with any [`RawLock`].
pub trait RawCond: Send + Sync {
    /// Wake one waiter, or all of them.
    fn signal(&self, broadcast: bool);

    /// Atomically release `lock`, wait for a signal or the timeout, and
    /// re-acquire `lock` before returning. Returns `false` on timeout.
    /// The caller must hold `lock` exactly once.
    fn wait(&self, lock: &dyn RawLock, timeout: Option<Duration>) -> bool;
}

/// Factory for locks and conditions.
pub trait ThreadCallbacks: Send + Sync {
    fn alloc_lock(&self, kind: LockKind) -> Box<dyn RawLock>;
    fn alloc_cond(&self) -> Box<dyn RawCond>;
}

// ── Thread identity ──────────────────────────────────────────────────

pub type ThreadIdFn = fn() -> u64;

static ID_CALLBACK: AtomicUsize = AtomicUsize::new(0);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Identity of the calling thread, per the installed id callback or a
/// process-unique default.
pub fn thread_id() -> u64 {
    let p = ID_CALLBACK.load(Ordering::Relaxed);
    if p != 0 {
        // Safety: only ever stores a ThreadIdFn (see set_id_callback).
        let f: ThreadIdFn = unsafe { std::mem::transmute(p) };
        return f();
    }
    THREAD_ID.with(|t| *t)
}

/// Install a custom thread-id function. Refused once a lock exists.
pub fn set_id_callback(f: ThreadIdFn) -> Result<()> {
    if FROZEN.load(Ordering::Acquire) {
        ev_warn!("can't change the thread-id callback once locks are in use");
        return Err(ReventError::ThreadingFrozen);
    }
    ID_CALLBACK.store(f as usize, Ordering::Relaxed);
    Ok(())
}

// ── Default provider ─────────────────────────────────────────────────

/// Lock and condition implementations over `std::sync`.
///
/// The recursive flavor is owner-thread + depth on top of a plain mutex;
/// std has no recursive mutex of its own.
pub struct StdThreads;

#[derive(Default)]
struct LockState {
    owner: u64,
    depth: u32,
}

struct StdLock {
    kind: LockKind,
    state: Mutex<LockState>,
    cv: Condvar,
}

impl StdLock {
    fn new(kind: LockKind) -> Self {
        StdLock {
            kind,
            state: Mutex::new(LockState::default()),
            cv: Condvar::new(),
        }
    }
}

impl RawLock for StdLock {
    fn lock(&self) {
        let me = thread_id();
        let mut s = self.state.lock().unwrap();
        if s.depth > 0 && s.owner == me && self.kind == LockKind::Recursive {
            s.depth += 1;
            return;
        }
        // A plain lock re-acquired by its owner deadlocks here, as a
        // plain pthread mutex would. The debug wrapper turns it into an
        // abort instead.
        while s.depth > 0 {
            s = self.cv.wait(s).unwrap();
        }
        s.owner = me;
        s.depth = 1;
    }

    fn try_lock(&self) -> bool {
        let me = thread_id();
        let mut s = self.state.lock().unwrap();
        if s.depth == 0 {
            s.owner = me;
            s.depth = 1;
            true
        } else if s.owner == me && self.kind == LockKind::Recursive {
            s.depth += 1;
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        let mut s = self.state.lock().unwrap();
        if s.depth == 0 {
            ev_warn!("unlock of an unlocked lock");
            return;
        }
        s.depth -= 1;
        if s.depth == 0 {
            s.owner = 0;
            drop(s);
            self.cv.notify_one();
        }
    }
}

/// Mesa-style condition built from a sequence counter, usable with any
/// [`RawLock`]: the waiter pins the counter before releasing the caller's
/// lock, so a signal issued under that lock can't be lost.
struct StdCond {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl StdCond {
    fn new() -> Self {
        StdCond {
            seq: Mutex::new(0),
            cv: Condvar::new(),
        }
    }
}

impl RawCond for StdCond {
    fn signal(&self, broadcast: bool) {
        let mut s = self.seq.lock().unwrap();
        *s = s.wrapping_add(1);
        drop(s);
        if broadcast {
            self.cv.notify_all();
        } else {
            self.cv.notify_one();
        }
    }

    fn wait(&self, lock: &dyn RawLock, timeout: Option<Duration>) -> bool {
        let mut s = self.seq.lock().unwrap();
        let start = *s;
        lock.unlock();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = true;
        while *s == start {
            match deadline {
                None => {
                    s = self.cv.wait(s).unwrap();
                }
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        signaled = false;
                        break;
                    }
                    let (g, _) = self.cv.wait_timeout(s, dl - now).unwrap();
                    s = g;
                }
            }
        }
        drop(s);
        lock.lock();
        signaled
    }
}

impl ThreadCallbacks for StdThreads {
    fn alloc_lock(&self, kind: LockKind) -> Box<dyn RawLock> {
        Box::new(StdLock::new(kind))
    }

    fn alloc_cond(&self) -> Box<dyn RawCond> {
        Box::new(StdCond::new())
    }
}

// ── Debug wrappers ───────────────────────────────────────────────────

struct DebugMeta {
    held_by: u64,
    count: i64,
}

/// Verifies the locking contract around an inner lock. The inner lock is
/// always recursive so that a contract violation is observed here rather
/// than deadlocking below us.
pub struct DebugLock {
    kind: LockKind,
    inner: Box<dyn RawLock>,
    meta: Mutex<DebugMeta>,
}

impl DebugLock {
    pub(crate) fn new(inner: Box<dyn RawLock>, kind: LockKind) -> Self {
        DebugLock {
            kind,
            inner,
            meta: Mutex::new(DebugMeta {
                held_by: 0,
                count: 0,
            }),
        }
    }

    fn mark_locked(&self) {
        let me = thread_id();
        let mut m = self.meta.lock().unwrap();
        m.count += 1;
        if self.kind != LockKind::Recursive && m.count != 1 {
            ev_fatal!("lock debugging: non-recursive lock acquired {} times", m.count);
        }
        if m.count > 1 && m.held_by != me {
            ev_fatal!(
                "lock debugging: thread {} re-acquired a lock held by thread {}",
                me,
                m.held_by
            );
        }
        m.held_by = me;
    }

    fn mark_unlocked(&self) {
        let me = thread_id();
        let mut m = self.meta.lock().unwrap();
        if m.count <= 0 {
            ev_fatal!("lock debugging: unlock without a matching lock");
        }
        if m.held_by != me {
            ev_fatal!(
                "lock debugging: thread {} unlocked a lock held by thread {}",
                me,
                m.held_by
            );
        }
        m.count -= 1;
        if m.count == 0 {
            m.held_by = 0;
        }
    }
}

impl RawLock for DebugLock {
    fn lock(&self) {
        self.inner.lock();
        self.mark_locked();
    }

    fn try_lock(&self) -> bool {
        if self.inner.try_lock() {
            self.mark_locked();
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        self.mark_unlocked();
        self.inner.unlock();
    }

    fn held_by_current(&self) -> bool {
        let m = self.meta.lock().unwrap();
        m.count > 0 && m.held_by == thread_id()
    }
}

struct DebugCond {
    inner: Box<dyn RawCond>,
}

impl RawCond for DebugCond {
    fn signal(&self, broadcast: bool) {
        self.inner.signal(broadcast)
    }

    fn wait(&self, lock: &dyn RawLock, timeout: Option<Duration>) -> bool {
        if !lock.held_by_current() {
            ev_fatal!("lock debugging: condition wait without holding the paired lock");
        }
        // The release/re-acquire goes through the lock's own vtable, so
        // the wrapper's bookkeeping stays consistent across the wait.
        self.inner.wait(lock, timeout)
    }
}

struct DebugThreads {
    inner: Arc<dyn ThreadCallbacks>,
}

impl ThreadCallbacks for DebugThreads {
    fn alloc_lock(&self, kind: LockKind) -> Box<dyn RawLock> {
        Box::new(DebugLock::new(
            self.inner.alloc_lock(LockKind::Recursive),
            kind,
        ))
    }

    fn alloc_cond(&self) -> Box<dyn RawCond> {
        Box::new(DebugCond {
            inner: self.inner.alloc_cond(),
        })
    }
}

// ── Process-wide provider ────────────────────────────────────────────

static FROZEN: AtomicBool = AtomicBool::new(false);

struct Shim {
    callbacks: Arc<dyn ThreadCallbacks>,
    debug: bool,
}

fn shim() -> &'static Mutex<Option<Shim>> {
    static SHIM: Mutex<Option<Shim>> = Mutex::new(None);
    &SHIM
}

/// Install a custom lock/condition provider as the process default.
/// Refused once any lock has been handed out.
pub fn set_thread_callbacks(cbs: Arc<dyn ThreadCallbacks>) -> Result<()> {
    let mut s = shim().lock().unwrap();
    if FROZEN.load(Ordering::Acquire) {
        ev_warn!("can't change threading callbacks once locks are in use");
        return Err(ReventError::ThreadingFrozen);
    }
    let debug = s.as_ref().map(|s| s.debug).unwrap_or(false);
    *s = Some(Shim {
        callbacks: cbs,
        debug,
    });
    Ok(())
}

/// Install [`StdThreads`] as the process default. This is also what an
/// un-configured process gets implicitly.
pub fn use_std_threads() -> Result<()> {
    set_thread_callbacks(Arc::new(StdThreads))
}

/// Wrap the provider in the contract-checking debug layer. Idempotent;
/// refused once any lock has been handed out.
pub fn enable_lock_debugging() -> Result<()> {
    let mut s = shim().lock().unwrap();
    if s.as_ref().map(|s| s.debug).unwrap_or(false) {
        return Ok(());
    }
    if FROZEN.load(Ordering::Acquire) {
        ev_warn!("can't enable lock debugging once locks are in use");
        return Err(ReventError::ThreadingFrozen);
    }
    let callbacks = s
        .take()
        .map(|s| s.callbacks)
        .unwrap_or_else(|| Arc::new(StdThreads));
    *s = Some(Shim {
        callbacks,
        debug: true,
    });
    Ok(())
}

fn resolve(explicit: Option<&Arc<dyn ThreadCallbacks>>) -> (Arc<dyn ThreadCallbacks>, bool) {
    let s = shim().lock().unwrap();
    let debug = s.as_ref().map(|s| s.debug).unwrap_or(false);
    let cbs = match explicit {
        Some(c) => c.clone(),
        None => s
            .as_ref()
            .map(|s| s.callbacks.clone())
            .unwrap_or_else(|| Arc::new(StdThreads)),
    };
    (cbs, debug)
}

/// Allocate a lock from the given provider, or the process default.
/// Freezes the callback table.
pub(crate) fn alloc_lock_for(
    explicit: Option<&Arc<dyn ThreadCallbacks>>,
    kind: LockKind,
) -> Box<dyn RawLock> {
    FROZEN.store(true, Ordering::Release);
    let (cbs, debug) = resolve(explicit);
    if debug {
        DebugThreads { inner: cbs }.alloc_lock(kind)
    } else {
        cbs.alloc_lock(kind)
    }
}

/// Allocate a condition from the given provider, or the process default.
pub(crate) fn alloc_cond_for(explicit: Option<&Arc<dyn ThreadCallbacks>>) -> Box<dyn RawCond> {
    FROZEN.store(true, Ordering::Release);
    let (cbs, debug) = resolve(explicit);
    if debug {
        DebugThreads { inner: cbs }.alloc_cond()
    } else {
        cbs.alloc_cond()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_recursive_lock_depth() {
        let lock = StdLock::new(LockKind::Recursive);
        lock.lock();
        lock.lock();
        assert!(lock.try_lock());
        lock.unlock();
        lock.unlock();
        lock.unlock();
        // fully released: another acquire starts at depth one again
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn test_plain_lock_contention() {
        let lock = Arc::new(StdLock::new(LockKind::Plain));
        lock.lock();
        let l2 = lock.clone();
        let t = thread::spawn(move || {
            assert!(!l2.try_lock());
        });
        t.join().unwrap();
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        let lock = Arc::new(StdLock::new(LockKind::Recursive));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn test_cond_wait_timeout() {
        let lock = StdLock::new(LockKind::Recursive);
        let cond = StdCond::new();
        lock.lock();
        let signaled = cond.wait(&lock, Some(Duration::from_millis(20)));
        assert!(!signaled);
        lock.unlock();
    }

    #[test]
    fn test_cond_signal_wakes_waiter() {
        let lock = Arc::new(StdLock::new(LockKind::Recursive));
        let cond = Arc::new(StdCond::new());

        let l2 = lock.clone();
        let c2 = cond.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            l2.lock();
            c2.signal(false);
            l2.unlock();
        });

        lock.lock();
        let signaled = cond.wait(&*lock, Some(Duration::from_secs(5)));
        lock.unlock();
        t.join().unwrap();
        assert!(signaled);
    }

    #[test]
    fn test_debug_lock_held_by_current() {
        let dl = DebugLock::new(Box::new(StdLock::new(LockKind::Recursive)), LockKind::Recursive);
        assert!(!dl.held_by_current());
        dl.lock();
        assert!(dl.held_by_current());
        let held_elsewhere = {
            let dl = &dl;
            thread::scope(|s| s.spawn(|| dl.held_by_current()).join().unwrap())
        };
        assert!(!held_elsewhere);
        dl.unlock();
        assert!(!dl.held_by_current());
    }

    #[test]
    fn test_callbacks_frozen_after_alloc() {
        let _lock = alloc_lock_for(None, LockKind::Recursive);
        assert!(use_std_threads().is_err());
        assert!(enable_lock_debugging().is_err());
        assert!(set_id_callback(|| 7).is_err());
    }
}
