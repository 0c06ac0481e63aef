//! Base configuration

use std::sync::Arc;

use crate::backend::BackendFeatures;
use crate::sync::ThreadCallbacks;

/// Most priority levels a base may be configured with.
pub const MAX_PRIORITIES: usize = 256;

/// Everything a base's construction can be steered by. Starts from
/// `Default` and chains:
///
/// ```ignore
/// let base = Base::with_config(
///     Config::default().priorities(4).changelist(true),
/// )?;
/// ```
pub struct Config {
    /// Backend names to try, most preferred first. Empty = registry order.
    pub(crate) backends: Vec<String>,
    /// Capabilities a backend must advertise to be considered.
    pub(crate) required: BackendFeatures,
    /// Ask the backend for microsecond-precision waits (timerfd on epoll).
    pub(crate) precise_timer: bool,
    /// Batch registration changes per dispatch pass instead of issuing
    /// them synchronously.
    pub(crate) changelist: bool,
    /// Ignore `EVENT_*` environment variables.
    pub(crate) ignore_env: bool,
    /// Number of priority levels (1..=256).
    pub(crate) priorities: usize,
    /// Locking provider for this base; the process default when unset.
    pub(crate) threads: Option<Arc<dyn ThreadCallbacks>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backends: Vec::new(),
            required: BackendFeatures::empty(),
            precise_timer: false,
            changelist: false,
            ignore_env: false,
            priorities: 1,
            threads: None,
        }
    }
}

impl Config {
    /// Append a backend name to the preference list.
    pub fn backend(mut self, name: &str) -> Self {
        self.backends.push(name.to_string());
        self
    }

    pub fn require(mut self, features: BackendFeatures) -> Self {
        self.required |= features;
        self
    }

    pub fn precise_timer(mut self, on: bool) -> Self {
        self.precise_timer = on;
        self
    }

    pub fn changelist(mut self, on: bool) -> Self {
        self.changelist = on;
        self
    }

    pub fn ignore_env(mut self, on: bool) -> Self {
        self.ignore_env = on;
        self
    }

    pub fn priorities(mut self, n: usize) -> Self {
        self.priorities = n;
        self
    }

    pub fn thread_callbacks(mut self, cbs: Arc<dyn ThreadCallbacks>) -> Self {
        self.threads = Some(cbs);
        self
    }
}
