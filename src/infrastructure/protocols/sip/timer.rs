//! Timer wheel
//!
//! Deadline-ordered store of timer payloads. Nothing here reads the clock:
//! the owner passes `now` in, which keeps every state machine driven by the
//! wheel deterministic under test. Entries due at the same instant fire in
//! the order they were scheduled.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Cancellation token for a scheduled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

pub struct TimerWheel<T> {
    entries: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedule `payload` to fire `delay` after `now`
    pub fn schedule(&mut self, now: Instant, delay: Duration, payload: T) -> TimerToken {
        self.schedule_at(now + delay, payload)
    }

    /// Schedule `payload` to fire at an absolute instant
    pub fn schedule_at(&mut self, at: Instant, payload: T) -> TimerToken {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((at, id), payload);
        self.deadlines.insert(id, at);
        TimerToken(id)
    }

    /// Cancel an entry. Returns false when it already fired or was cancelled.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        match self.deadlines.remove(&token.0) {
            Some(at) => self.entries.remove(&(at, token.0)).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, token: TimerToken) -> bool {
        self.deadlines.contains_key(&token.0)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest entry due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerToken, T)> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        let payload = self.entries.remove(&key)?;
        self.deadlines.remove(&key.1);
        Some((TimerToken(key.1), payload))
    }

    /// Remove and return every entry due at or before `now`, in firing order
    pub fn advance(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        while let Some((_, payload)) = self.pop_due(now) {
            fired.push(payload);
        }
        fired
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule(now, Duration::from_millis(300), "c");
        wheel.schedule(now, Duration::from_millis(100), "a");
        wheel.schedule(now, Duration::from_millis(200), "b");

        assert!(wheel.advance(now + Duration::from_millis(50)).is_empty());
        assert_eq!(wheel.advance(now + Duration::from_millis(250)), vec!["a", "b"]);
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(300)));
        assert_eq!(wheel.advance(now + Duration::from_secs(1)), vec!["c"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_same_instant_is_fifo() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        for i in 0..5 {
            wheel.schedule(now, Duration::from_secs(1), i);
        }
        assert_eq!(wheel.advance(now + Duration::from_secs(1)), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_entries_never_fire() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        let token = wheel.schedule(now, Duration::from_secs(1), "stale");
        wheel.schedule(now, Duration::from_secs(2), "live");

        assert!(wheel.cancel(token));
        assert!(!wheel.cancel(token));
        assert!(!wheel.is_scheduled(token));
        assert_eq!(wheel.advance(now + Duration::from_secs(5)), vec!["live"]);
    }

    #[test]
    fn test_pop_due_sees_entries_scheduled_while_draining() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule(now, Duration::ZERO, 1);

        let (_, first) = wheel.pop_due(now).unwrap();
        assert_eq!(first, 1);
        wheel.schedule(now, Duration::ZERO, 2);
        let (_, second) = wheel.pop_due(now).unwrap();
        assert_eq!(second, 2);
        assert!(wheel.pop_due(now).is_none());
    }
}
