//! Loop wakeup notifier
//!
//! A registration issued from a foreign thread only takes effect after
//! the loop's current backend wait returns; writing this eventfd is how
//! that wait is cut short. Counter semantics coalesce: any number of
//! wakeups before the loop drains collapse into one.

use std::os::unix::io::RawFd;

use revent_core::{ev_warn, ReventError, Result};

use crate::last_errno;

pub(crate) struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ReventError::Os(last_errno()));
        }
        Ok(Notifier { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the loop. Callable from any thread, never blocks.
    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // EAGAIN means the counter is saturated: a wakeup is already
            // pending, which is all we wanted
            if errno != libc::EAGAIN {
                ev_warn!("notifier write: errno {}", errno);
            }
        }
    }

    /// Reset the counter after the loop woke.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces_and_drains() {
        let n = Notifier::create().unwrap();
        n.notify();
        n.notify();
        n.notify();

        // counter is readable exactly once
        let mut val: u64 = 0;
        let r = unsafe {
            libc::read(
                n.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(r, 8);
        assert_eq!(val, 3);

        // drained: the next read would block
        let r = unsafe {
            libc::read(
                n.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(r, -1);
        assert_eq!(last_errno(), libc::EAGAIN);

        n.notify();
        n.drain();
    }
}
