//! Backend abstraction
//!
//! A backend wraps one OS readiness primitive behind a uniform
//! add/delete/dispatch contract and advertises what it can do through
//! capability flags. Backends register in [`BACKENDS`] at build time;
//! base construction walks the table in preference order, skips entries
//! missing a required capability or vetoed by an `EVENT_NO<NAME>`
//! environment variable, and takes the first one that initializes.

pub(crate) mod epoll;

use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

use revent_core::{env_is_set, ev_debug, ev_warn, EventMask, ReventError, Result};

use crate::changelist::Change;
use crate::config::Config;

bitflags! {
    /// What a backend can do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BackendFeatures: u8 {
        /// Edge-triggered readiness reporting.
        const ET = 0x01;
        /// O(1) add and delete.
        const O1 = 0x02;
        /// Detects peer half-close as a distinct condition.
        const EARLY_CLOSE = 0x04;
        /// The instance must be rebuilt in a forked child.
        const REINIT_AFTER_FORK = 0x08;
    }
}

/// Options a backend needs at init time; kept by the base so `reinit`
/// can rebuild the same instance after fork.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BackendOpts {
    pub precise_timer: bool,
}

/// One readiness report from a dispatch call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub fd: RawFd,
    pub mask: EventMask,
}

/// Uniform contract over one OS readiness primitive.
///
/// `apply_change` is called with the base lock held and must not block.
/// `dispatch` is called with the base lock released; the base guarantees
/// only the thread driving the loop calls it, never concurrently.
pub(crate) trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn features(&self) -> BackendFeatures;

    /// Translate one coalesced change into the minimum OS operations.
    fn apply_change(&self, ch: &Change) -> Result<()>;

    /// Block up to `timeout` (`None` = indefinitely, zero = poll),
    /// then append one `Ready` per fd with observed readiness.
    fn dispatch(&self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> Result<()>;
}

pub(crate) struct BackendInfo {
    pub name: &'static str,
    pub features: BackendFeatures,
    pub init: fn(&BackendOpts) -> Result<Box<dyn Backend>>,
}

/// Registered backends, default preference order.
pub(crate) static BACKENDS: &[BackendInfo] = &[epoll::INFO];

/// Pick and initialize a backend for `config`.
pub(crate) fn select(config: &Config) -> Result<(&'static BackendInfo, Box<dyn Backend>)> {
    let opts = BackendOpts {
        precise_timer: config.precise_timer,
    };
    let mut last_err = None;

    let wanted: Vec<&str> = config.backends.iter().map(|s| s.as_str()).collect();
    let order: Vec<&'static BackendInfo> = if wanted.is_empty() {
        BACKENDS.iter().collect()
    } else {
        wanted
            .iter()
            .filter_map(|name| BACKENDS.iter().find(|i| i.name == *name))
            .collect()
    };

    for info in order {
        if !info.features.contains(config.required) {
            ev_debug!("backend {} lacks required features", info.name);
            continue;
        }
        if !config.ignore_env {
            let veto = format!("EVENT_NO{}", info.name.to_uppercase());
            if env_is_set(&veto) {
                ev_debug!("backend {} vetoed by {}", info.name, veto);
                continue;
            }
        }
        match (info.init)(&opts) {
            Ok(b) => return Ok((info, b)),
            Err(e) => {
                ev_warn!("backend {} failed to initialize: {}", info.name, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(ReventError::NoBackend))
}
