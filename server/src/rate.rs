//! Sliding-window rate keeping.
//!
//! [`Ratekeeper`] is lock-free so the per-connection packet counter can be
//! bumped from the reader tasks while the dispatcher reads it. The count
//! may be off by a packet under contention, which has no correctness
//! impact.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn now_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Counts occurrences inside a rolling window.
#[derive(Debug, Default)]
pub struct Ratekeeper {
    window_start: AtomicU64,
    count: AtomicU32,
}

impl Ratekeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence; returns whether it stays within `cap` per
    /// `window`.
    pub fn allow(&self, window: Duration, cap: u32) -> bool {
        let now = now_millis();
        let start = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(start) > window.as_millis() as u64 {
            self.window_start.store(now, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            true
        } else {
            self.count.fetch_add(1, Ordering::Relaxed) < cap
        }
    }
}

/// Window for the per-connection packet-spam counter.
pub const SPAM_WINDOW: Duration = Duration::from_secs(3);

/// Window for per-address join attempts.
pub const JOIN_WINDOW: Duration = Duration::from_secs(60);

/// Window and cap for per-address info requests.
pub const INFO_WINDOW: Duration = Duration::from_secs(3);
pub const INFO_CAP: u32 = 10;

/// Window and cap for per-address list requests.
pub const LIST_WINDOW: Duration = Duration::from_secs(3);
pub const LIST_CAP: u32 = 10;

/// Per-address request rates. Join, info and list each get their own
/// window so a burst of one kind cannot starve the others.
#[derive(Debug, Default)]
pub struct AddressRater {
    join: Ratekeeper,
    info: Ratekeeper,
    list: Ratekeeper,
}

impl AddressRater {
    pub fn new() -> Self {
        Self::default()
    }

    /// `limit` of 0 disables join limiting.
    pub fn allow_join(&self, limit: u32) -> bool {
        limit == 0 || self.join.allow(JOIN_WINDOW, limit)
    }

    pub fn allow_info(&self) -> bool {
        self.info.allow(INFO_WINDOW, INFO_CAP)
    }

    pub fn allow_list(&self) -> bool {
        self.list.allow(LIST_WINDOW, LIST_CAP)
    }
}
