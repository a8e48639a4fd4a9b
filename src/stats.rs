//! Externally observable counters.
//!
//! Population gauges track how many hosts each catcher group currently
//! holds; rejection counters record why admissions were turned away. They
//! are plain atomics so a UI or telemetry exporter can share the `Arc` and
//! read without going through the core's actor.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct CoreStats {
    /// Hosts in the regular catcher (fresh + valid).
    pub hosts_in_catcher: AtomicU32,
    /// Hosts in the ultrapeer catcher (fresh + valid).
    pub hosts_in_ultra_catcher: AtomicU32,
    /// Hosts across the four bad caches.
    pub hosts_in_bad_catcher: AtomicU32,
    /// Hosts in the running GUESS cache.
    pub hosts_in_guess_catcher: AtomicU32,
    /// Hosts in the GUESS introduction cache.
    pub hosts_in_guess_intro_catcher: AtomicU32,

    /// Admissions rejected because the candidate was ourselves.
    pub local_instance_rejects: AtomicU32,
    /// Admissions rejected because we are connected to the candidate.
    pub already_connected_rejects: AtomicU32,
    /// Admissions rejected as unroutable, bogus or hostile.
    pub invalid_host_rejects: AtomicU32,
}

impl CoreStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hosts_in_catcher: self.hosts_in_catcher.load(Ordering::Relaxed),
            hosts_in_ultra_catcher: self.hosts_in_ultra_catcher.load(Ordering::Relaxed),
            hosts_in_bad_catcher: self.hosts_in_bad_catcher.load(Ordering::Relaxed),
            hosts_in_guess_catcher: self.hosts_in_guess_catcher.load(Ordering::Relaxed),
            hosts_in_guess_intro_catcher: self.hosts_in_guess_intro_catcher.load(Ordering::Relaxed),
            local_instance_rejects: self.local_instance_rejects.load(Ordering::Relaxed),
            already_connected_rejects: self.already_connected_rejects.load(Ordering::Relaxed),
            invalid_host_rejects: self.invalid_host_rejects.load(Ordering::Relaxed),
        }
    }
}

/// Helpers for the gauge update discipline: single increments while the
/// owner is outside a mass update, one absolute store when it ends.
pub(crate) fn gauge_add(gauge: &AtomicU32, delta: u32) {
    gauge.fetch_add(delta, Ordering::Relaxed);
}

pub(crate) fn gauge_sub(gauge: &AtomicU32, delta: u32) {
    // Saturating: a drifted gauge must not wrap into the billions.
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(delta))
    });
}

pub(crate) fn gauge_set(gauge: &AtomicU32, value: u32) {
    gauge.store(value, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hosts_in_catcher: u32,
    pub hosts_in_ultra_catcher: u32,
    pub hosts_in_bad_catcher: u32,
    pub hosts_in_guess_catcher: u32,
    pub hosts_in_guess_intro_catcher: u32,
    pub local_instance_rejects: u32,
    pub already_connected_rejects: u32,
    pub invalid_host_rejects: u32,
}
