//! revent error types.

use std::fmt;

#[derive(Debug)]
pub enum ReventError {
    /// OS error with errno.
    Os(i32),
    /// No backend satisfied the configuration (name list + required features).
    NoBackend,
    /// A backend change for this fd failed and could not be recovered.
    BackendChange { fd: i32, errno: i32 },
    /// Priority outside the base's configured range.
    InvalidPriority(usize),
    /// The operation needs an event that is still live, but the handle is stale
    /// or the event is being finalized.
    EventGone,
    /// The operation is refused while the event sits in an activation queue.
    EventActive,
    /// The common-timeout handle does not belong to this base.
    UnknownCommonTimeout,
    /// Threading callbacks cannot change once a lock has been handed out.
    ThreadingFrozen,
    /// The base is already running its dispatch loop on another thread.
    LoopRunning,
    /// Another base in this process already owns signal delivery.
    SignalsOwned,
}

impl fmt::Display for ReventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::NoBackend => write!(f, "no usable backend"),
            Self::BackendChange { fd, errno } => {
                write!(f, "backend change on fd {} failed: errno {}", fd, errno)
            }
            Self::InvalidPriority(p) => write!(f, "invalid priority {}", p),
            Self::EventGone => write!(f, "event is gone or finalizing"),
            Self::EventActive => write!(f, "event is queued for activation"),
            Self::UnknownCommonTimeout => write!(f, "unknown common timeout"),
            Self::ThreadingFrozen => write!(f, "threading callbacks already initialized"),
            Self::LoopRunning => write!(f, "dispatch loop already running"),
            Self::SignalsOwned => write!(f, "signal delivery owned by another base"),
        }
    }
}

impl std::error::Error for ReventError {}

pub type Result<T> = std::result::Result<T, ReventError>;
