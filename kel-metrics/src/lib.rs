#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Controller observability counters.
//!
//! Plain atomics instead of a metrics facade: the controller sits on the
//! node's hot decision path and these are incremented per message. A
//! scraper (metrics endpoint, tests) reads them through [`snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

pub static ROLE_TRANSITIONS: AtomicU64 = AtomicU64::new(0);
pub static STALE_MESSAGES_DROPPED: AtomicU64 = AtomicU64::new(0);
pub static ELECTIONS_TRIGGERED: AtomicU64 = AtomicU64::new(0);
pub static SPLIT_BRAIN_DETECTIONS: AtomicU64 = AtomicU64::new(0);
pub static WRITES_FORWARDED: AtomicU64 = AtomicU64::new(0);
pub static FORWARD_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
pub static REQUESTS_DENIED_NOT_READY: AtomicU64 = AtomicU64::new(0);
pub static REQUESTS_DENIED_NOT_LEADER: AtomicU64 = AtomicU64::new(0);
pub static REQUESTS_DENIED_READ_ONLY: AtomicU64 = AtomicU64::new(0);
pub static SHUTDOWN_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

/// Current role as an ordinal, for the health/metrics surface.
pub static CURRENT_ROLE: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn increment_role_transitions() {
    ROLE_TRANSITIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_stale_drops() {
    STALE_MESSAGES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_elections_triggered() {
    ELECTIONS_TRIGGERED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_split_brain_detections() {
    SPLIT_BRAIN_DETECTIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_writes_forwarded() {
    WRITES_FORWARDED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_forward_timeouts() {
    FORWARD_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_denied_not_ready() {
    REQUESTS_DENIED_NOT_READY.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_denied_not_leader() {
    REQUESTS_DENIED_NOT_LEADER.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_denied_read_only() {
    REQUESTS_DENIED_READ_ONLY.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_shutdown_timeouts() {
    SHUTDOWN_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn set_current_role(ordinal: u64) {
    CURRENT_ROLE.store(ordinal, Ordering::Relaxed);
}

#[inline]
#[must_use]
pub fn current_role() -> u64 {
    CURRENT_ROLE.load(Ordering::Relaxed)
}

/// Point-in-time copy of every controller counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub role_transitions: u64,
    pub stale_messages_dropped: u64,
    pub elections_triggered: u64,
    pub split_brain_detections: u64,
    pub writes_forwarded: u64,
    pub forward_timeouts: u64,
    pub denied_not_ready: u64,
    pub denied_not_leader: u64,
    pub denied_read_only: u64,
    pub shutdown_timeouts: u64,
    pub current_role: u64,
}

#[must_use]
pub fn snapshot() -> ControllerSnapshot {
    ControllerSnapshot {
        role_transitions: ROLE_TRANSITIONS.load(Ordering::Relaxed),
        stale_messages_dropped: STALE_MESSAGES_DROPPED.load(Ordering::Relaxed),
        elections_triggered: ELECTIONS_TRIGGERED.load(Ordering::Relaxed),
        split_brain_detections: SPLIT_BRAIN_DETECTIONS.load(Ordering::Relaxed),
        writes_forwarded: WRITES_FORWARDED.load(Ordering::Relaxed),
        forward_timeouts: FORWARD_TIMEOUTS.load(Ordering::Relaxed),
        denied_not_ready: REQUESTS_DENIED_NOT_READY.load(Ordering::Relaxed),
        denied_not_leader: REQUESTS_DENIED_NOT_LEADER.load(Ordering::Relaxed),
        denied_read_only: REQUESTS_DENIED_READ_ONLY.load(Ordering::Relaxed),
        shutdown_timeouts: SHUTDOWN_TIMEOUTS.load(Ordering::Relaxed),
        current_role: CURRENT_ROLE.load(Ordering::Relaxed),
    }
}
