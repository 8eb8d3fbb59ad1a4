//! Keyed timer queue for the dispatcher loop.
//!
//! Every deferred action the relay takes (state watchdogs, list-refresh
//! watchdogs, the shutdown grace) is keyed so rescheduling and cancelling
//! are O(1) map operations; cancelled entries stay in the heap and are
//! skipped when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use roomlink_protocol::{GameType, RoomId};
use tokio::time::Instant;

/// What a timer will do when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Flush pending info requesters of a room with whatever state exists.
    StateWatchdog(RoomId),
    /// Flush a type's list cache even if states are still missing.
    ListRefresh(GameType),
    /// End the shutdown grace period.
    ShutdownGrace,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Live sequence number per key; stale heap entries are skipped.
    live: HashMap<TimerKey, u64>,
    by_seq: HashMap<u64, TimerKey>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `key`.
    pub fn schedule(&mut self, key: TimerKey, deadline: Instant) {
        self.cancel(&key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(key.clone(), seq);
        self.by_seq.insert(seq, key);
        self.heap.push(Reverse((deadline, seq)));
    }

    /// Disarm the timer for `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        if let Some(seq) = self.live.remove(key) {
            self.by_seq.remove(&seq);
            true
        } else {
            false
        }
    }

    /// The earliest live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.by_seq.contains_key(&seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop one timer that is due at `now`, disarming it.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(key) = self.by_seq.remove(&seq) {
                self.live.remove(&key);
                return Some(key);
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.by_seq.clear();
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.live.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(TimerKey::ShutdownGrace, now + Duration::from_secs(2));
        timers.schedule(TimerKey::StateWatchdog(RoomId(1)), now + Duration::from_secs(1));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(timers.pop_due(now).is_none());

        let later = now + Duration::from_secs(3);
        assert_eq!(
            timers.pop_due(later),
            Some(TimerKey::StateWatchdog(RoomId(1)))
        );
        assert_eq!(timers.pop_due(later), Some(TimerKey::ShutdownGrace));
        assert!(timers.pop_due(later).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_firing() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let key = TimerKey::StateWatchdog(RoomId(7));
        timers.schedule(key.clone(), now + Duration::from_secs(1));
        assert!(timers.cancel(&key));
        assert!(!timers.cancel(&key));
        assert!(timers.pop_due(now + Duration::from_secs(5)).is_none());
        assert!(timers.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_earlier_deadline() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let key = TimerKey::ListRefresh("game".parse().unwrap());
        timers.schedule(key.clone(), now + Duration::from_secs(1));
        timers.schedule(key.clone(), now + Duration::from_secs(10));

        // The first deadline is stale and must not fire the key.
        assert!(timers.pop_due(now + Duration::from_secs(5)).is_none());
        assert_eq!(
            timers.pop_due(now + Duration::from_secs(10)),
            Some(key)
        );
    }
}
