//! Signal delivery shim
//!
//! Signals reach the loop through a non-blocking self-pipe: a process
//! wide handler writes the signal number, and the base watches the read
//! end with an internal persistent read event whose drain fans the
//! delivered counts out to registered signal events.
//!
//! Signal disposition is process state, so exactly one base may own
//! delivery at a time. Previous handlers are saved on install and put
//! back when the last watcher for a signal goes away. `Base::reinit`
//! rebuilds the pipe in a forked child.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use revent_core::{ev_warn, ReventError, Result};

use crate::last_errno;

/// Largest signal number we track (Linux NSIG).
pub(crate) const MAX_SIGNAL: usize = 64;

/// Write end of the owning base's self-pipe; -1 when unowned.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_pipe_handler(sig: libc::c_int) {
    // async-signal-safe: one write, errno preserved
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            let saved = *libc::__errno_location();
            let byte = sig as u8;
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            *libc::__errno_location() = saved;
        }
    }
}

pub(crate) struct SignalShim {
    read_fd: RawFd,
    write_fd: RawFd,
    /// Dispositions to put back when a signal is dropped.
    saved: HashMap<i32, libc::sigaction>,
}

impl SignalShim {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = Self::make_pipe()?;
        if SIGNAL_WRITE_FD
            .compare_exchange(-1, write_fd, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(ReventError::SignalsOwned);
        }
        Ok(SignalShim {
            read_fd,
            write_fd,
            saved: HashMap::new(),
        })
    }

    fn make_pipe() -> Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            return Err(ReventError::Os(last_errno()));
        }
        Ok((fds[0], fds[1]))
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Point `sig` at the self-pipe handler, keeping the old disposition.
    pub fn install(&mut self, sig: i32) -> Result<()> {
        if self.saved.contains_key(&sig) {
            return Ok(());
        }
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        let handler: extern "C" fn(libc::c_int) = signal_pipe_handler;
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut sa.sa_mask) };

        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaction(sig, &sa, &mut old) } < 0 {
            return Err(ReventError::Os(last_errno()));
        }
        self.saved.insert(sig, old);
        Ok(())
    }

    /// Put back the disposition `install` displaced.
    pub fn restore(&mut self, sig: i32) {
        if let Some(old) = self.saved.remove(&sig) {
            if unsafe { libc::sigaction(sig, &old, std::ptr::null_mut()) } < 0 {
                ev_warn!("restoring handler for signal {}: errno {}", sig, last_errno());
            }
        }
    }

    /// Empty the pipe; returns (signal, delivery count) pairs.
    pub fn drain(&self) -> Vec<(i32, u16)> {
        let mut counts = [0u16; MAX_SIGNAL + 1];
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for &b in &buf[..n as usize] {
                let sig = b as usize;
                if sig <= MAX_SIGNAL {
                    counts[sig] = counts[sig].saturating_add(1);
                }
            }
        }
        counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(sig, &c)| (sig as i32, c))
            .collect()
    }

    /// Rebuild the pipe in a forked child and re-point the handlers at
    /// it. The saved dispositions carry over.
    pub fn reinit(&mut self) -> Result<()> {
        let _ = SIGNAL_WRITE_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
        let (read_fd, write_fd) = Self::make_pipe()?;
        self.read_fd = read_fd;
        self.write_fd = write_fd;
        SIGNAL_WRITE_FD.store(write_fd, Ordering::SeqCst);

        let sigs: Vec<i32> = self.saved.keys().copied().collect();
        for sig in sigs {
            let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
            let handler: extern "C" fn(libc::c_int) = signal_pipe_handler;
            sa.sa_sigaction = handler as usize;
            sa.sa_flags = libc::SA_RESTART;
            unsafe {
                libc::sigemptyset(&mut sa.sa_mask);
                if libc::sigaction(sig, &sa, std::ptr::null_mut()) < 0 {
                    ev_warn!("reinstalling handler for signal {}: errno {}", sig, last_errno());
                }
            }
        }
        Ok(())
    }
}

impl Drop for SignalShim {
    fn drop(&mut self) {
        let sigs: Vec<i32> = self.saved.keys().copied().collect();
        for sig in sigs {
            self.restore(sig);
        }
        let _ = SIGNAL_WRITE_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
pub(crate) fn test_guard() -> &'static std::sync::Mutex<()> {
    // signal disposition and pipe ownership are process-global; tests
    // that touch them serialize here
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    &GUARD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip_and_counts() {
        let _g = test_guard().lock().unwrap();
        let mut shim = SignalShim::new().unwrap();

        // a second owner is refused while this one lives
        assert!(matches!(
            SignalShim::new(),
            Err(ReventError::SignalsOwned)
        ));

        // park SIGUSR2 on ignore so the default disposition can't fire
        unsafe {
            let mut ign: libc::sigaction = std::mem::zeroed();
            ign.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut ign.sa_mask);
            libc::sigaction(libc::SIGUSR2, &ign, std::ptr::null_mut());
        }

        shim.install(libc::SIGUSR2).unwrap();
        unsafe {
            libc::raise(libc::SIGUSR2);
            libc::raise(libc::SIGUSR2);
        }

        let drained = shim.drain();
        assert_eq!(drained, vec![(libc::SIGUSR2, 2)]);
        // nothing left
        assert!(shim.drain().is_empty());

        shim.restore(libc::SIGUSR2);
        // with the saved SIG_IGN back, raising is harmless
        unsafe { libc::raise(libc::SIGUSR2) };
        assert!(shim.drain().is_empty());
    }
}
