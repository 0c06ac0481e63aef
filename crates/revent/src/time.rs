//! Monotonic deadlines
//!
//! All timer math runs on a monotonic clock; wall time never enters the
//! timed paths. Deadlines are microseconds since a per-process origin,
//! compared with an insertion sequence number as the tie-break so equal
//! deadlines fire in the order they were scheduled.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// An absolute point on the process monotonic clock, microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Deadline {
    us: u64,
}

impl Deadline {
    pub const ZERO: Deadline = Deadline { us: 0 };

    pub fn now() -> Self {
        Deadline {
            us: origin().elapsed().as_micros() as u64,
        }
    }

    pub fn after(d: Duration) -> Self {
        Self::now().plus(d)
    }

    pub fn plus(self, d: Duration) -> Self {
        let add = d.as_micros().min(u64::MAX as u128) as u64;
        Deadline {
            us: self.us.saturating_add(add),
        }
    }

    /// Time left until this deadline, zero if already due.
    pub fn remaining(self, now: Deadline) -> Duration {
        Duration::from_micros(self.us.saturating_sub(now.us))
    }

    pub fn is_due(self, now: Deadline) -> bool {
        self.us <= now.us
    }
}

/// Round up to whole milliseconds so a millisecond-precision wait never
/// returns before the deadline.
pub(crate) fn duration_to_msec_ceil(d: Duration) -> i64 {
    let us = d.as_micros();
    ((us + 999) / 1000).min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_ordering() {
        let a = Deadline::now();
        let b = a.plus(Duration::from_millis(5));
        assert!(a < b);
        assert!(a.is_due(b));
        assert!(!b.is_due(a));
        assert_eq!(b.remaining(a), Duration::from_millis(5));
        assert_eq!(a.remaining(b), Duration::ZERO);
    }

    #[test]
    fn test_msec_ceil() {
        assert_eq!(duration_to_msec_ceil(Duration::ZERO), 0);
        assert_eq!(duration_to_msec_ceil(Duration::from_micros(1)), 1);
        assert_eq!(duration_to_msec_ceil(Duration::from_micros(1000)), 1);
        assert_eq!(duration_to_msec_ceil(Duration::from_micros(1001)), 2);
        assert_eq!(duration_to_msec_ceil(Duration::from_secs(2)), 2000);
    }
}
