use std::collections::{binary_heap::PeekMut, BinaryHeap};
use std::time::Instant;

use rustc_hash::FxHashMap;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to fire a retransmission probe or declare unacked packets lost
    LossDetection,
    /// When a pending acknowledgement can no longer be delayed
    AckDelay,
    /// When to close the connection after no activity
    Idle,
    /// When to give up on an unfinished handshake
    Handshake,
    /// When to send a PING to keep the connection alive
    KeepAlive,
    /// When a closed connection may forget its state
    Close,
}

/// Tracks the nearest deadline for each timer kind
///
/// Deadlines are absolute; re-setting a timer supersedes its prior deadline
/// and stale heap entries are purged lazily.
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    most_recent: FxHashMap<Timer, Instant>,
    queue: BinaryHeap<TimerEntry>,
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.most_recent.insert(timer, time);
        self.queue.push(TimerEntry { time, timer });
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.most_recent.get(&timer).copied()
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.most_recent.remove(&timer);
    }

    /// Earliest live deadline
    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        self.peek().map(|entry| entry.time)
    }

    /// Remove and return one timer due at or before `now`
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        let TimerEntry { time, timer } = self.peek()?;
        if time <= now {
            self.most_recent.remove(&timer);
            self.queue.pop();
            return Some(timer);
        }
        None
    }

    pub(crate) fn reset(&mut self) {
        self.most_recent.clear();
        self.queue.clear();
    }

    fn peek(&mut self) -> Option<TimerEntry> {
        while let Some(entry) = self.queue.peek_mut() {
            if self.most_recent.get(&entry.timer) != Some(&entry.time) {
                // Superseded or stopped
                PeekMut::pop(entry);
                continue;
            }
            return Some(*entry);
        }
        None
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct TimerEntry {
    time: Instant,
    timer: Timer,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap; reverse for earliest-first popping
        self.time
            .cmp(&other.time)
            .then_with(|| self.timer.cmp(&other.timer))
            .reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn supersede_and_expire() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now() + Duration::from_secs(10);
        timers.set(Timer::Idle, now - 3 * sec);
        timers.set(Timer::Close, now - 2 * sec);
        timers.set(Timer::Idle, now);

        assert_eq!(timers.next_timeout(), Some(now - 2 * sec));
        assert_eq!(timers.expire_before(now), Some(Timer::Close));
        assert_eq!(timers.expire_before(now), Some(Timer::Idle));
        assert_eq!(timers.expire_before(now), None);
    }

    #[test]
    fn stop_cancels() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        timers.set(Timer::KeepAlive, now);
        timers.stop(Timer::KeepAlive);
        assert_eq!(timers.expire_before(now), None);
        assert_eq!(timers.next_timeout(), None);
    }
}
