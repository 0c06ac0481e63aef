//! Environment variable utilities
//!
//! The reactor takes a handful of knobs from the environment: backend
//! vetoes (`EVENT_NO<NAME>`), the changelist opt-in
//! (`EVENT_EPOLL_USE_CHANGELIST`), and the logging switches
//! (`REVENT_LOG_LEVEL`, `REVENT_FLUSH_LOG`). The veto and opt-in
//! variables trigger on presence alone; the logging switches parse
//! their values through the helpers here.

use std::env;
use std::str::FromStr;

/// Parse `key` as a `T`; `default` covers both unset and malformed.
/// Surrounding whitespace in the value is ignored.
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Truthiness of `key`: "1", "true", "yes" and "on" count, any case.
/// A set-but-unrecognized value is false; unset yields the default.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => is_truthy(&raw),
        Err(_) => default,
    }
}

fn is_truthy(raw: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| raw.trim().eq_ignore_ascii_case(t))
}

/// `Some(T)` only when `key` is set and its value parses.
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}

/// Whether `key` is present at all; the value does not matter. This is
/// the contract the backend vetoes and the changelist opt-in follow.
pub fn env_is_set(key: &str) -> bool {
    env::var_os(key).is_some()
}
