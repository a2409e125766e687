//! Tick-driven eviction timers for the deduplication engine
//!
//! A small timer wheel advanced once per shell tick. Expiry does not run
//! callbacks: [`TickTimers::advance`] hands back the expired targets and
//! the caller applies them. The wheel is advanced with the dedup state
//! already borrowed, so pending-check eviction mutates the map in place
//! and must never re-enter the dedup lock; known-key eviction only needs
//! the key lock, which sits below it in the lock order.

use std::collections::HashMap;
use std::time::Duration;

use lattice_core::{ContentKey, Error, PeerKey, Result};

// ----------------------------------------------------------------------------
// Tokens and Targets
// ----------------------------------------------------------------------------

/// Handle of one eviction timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Key of a pending check negotiation: one per (content key, peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub key: ContentKey,
    pub peer: PeerKey,
}

/// What an expiring timer evicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictTarget {
    /// Drop the pending check for this (key, peer) pair.
    PendingCheck(PendingKey),
    /// Drop this key from the known-key set.
    KnownKey(ContentKey),
}

// ----------------------------------------------------------------------------
// Timer Wheel
// ----------------------------------------------------------------------------

struct TimerEntry {
    after_ticks: u64,
    /// Tick at which the timer fires; `None` until started.
    deadline: Option<u64>,
    target: EvictTarget,
}

/// Fixed-granularity timer wheel. Bounded: allocation fails once `max`
/// timers exist, keeping dedup state finite.
pub struct TickTimers {
    tick: Duration,
    now: u64,
    next_token: u64,
    max: usize,
    entries: HashMap<TimerToken, TimerEntry>,
}

impl TickTimers {
    pub fn new(tick: Duration, max: usize) -> Self {
        Self {
            tick,
            now: 0,
            next_token: 0,
            max,
            entries: HashMap::new(),
        }
    }

    fn ticks_for(&self, after: Duration) -> u64 {
        let tick = self.tick.as_nanos().max(1);
        let after = after.as_nanos();
        (after.div_ceil(tick) as u64).max(1)
    }

    /// Allocate an unarmed timer.
    pub fn create(&mut self, after: Duration, target: EvictTarget) -> Result<TimerToken> {
        if self.entries.len() >= self.max {
            return Err(Error::resource("eviction timer pool exhausted"));
        }
        let token = TimerToken(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        self.entries.insert(
            token,
            TimerEntry {
                after_ticks: self.ticks_for(after),
                deadline: None,
                target,
            },
        );
        Ok(token)
    }

    /// Arm a previously created timer.
    pub fn start(&mut self, token: TimerToken) -> Result<()> {
        let now = self.now;
        let entry = self
            .entries
            .get_mut(&token)
            .ok_or_else(|| Error::not_found("eviction timer gone"))?;
        if entry.deadline.is_some() {
            return Err(Error::mismatched("eviction timer already armed"));
        }
        entry.deadline = Some(now + entry.after_ticks);
        Ok(())
    }

    /// Remove a timer; idempotent.
    pub fn kill(&mut self, token: TimerToken) {
        self.entries.remove(&token);
    }

    /// Advance one tick and return the targets of every timer that
    /// fired.
    pub fn advance(&mut self) -> Vec<(TimerToken, EvictTarget)> {
        self.now += 1;
        let now = self.now;
        let fired: Vec<TimerToken> = self
            .entries
            .iter()
            .filter_map(|(token, entry)| match entry.deadline {
                Some(deadline) if deadline <= now => Some(*token),
                _ => None,
            })
            .collect();
        fired
            .into_iter()
            .filter_map(|token| {
                self.entries
                    .remove(&token)
                    .map(|entry| (token, entry.target))
            })
            .collect()
    }

    /// Number of timers, armed or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> ContentKey {
        ContentKey::from_payload(&[n])
    }

    #[test]
    fn test_timer_fires_after_its_ticks() {
        let mut timers = TickTimers::new(Duration::from_millis(10), 8);
        let token = timers
            .create(Duration::from_millis(25), EvictTarget::KnownKey(key(1)))
            .unwrap();
        timers.start(token).unwrap();

        // 25ms over a 10ms tick rounds up to 3 ticks
        assert!(timers.advance().is_empty());
        assert!(timers.advance().is_empty());
        let fired = timers.advance();
        assert_eq!(fired, vec![(token, EvictTarget::KnownKey(key(1)))]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_unarmed_timer_never_fires() {
        let mut timers = TickTimers::new(Duration::from_millis(10), 8);
        let _token = timers
            .create(Duration::from_millis(10), EvictTarget::KnownKey(key(1)))
            .unwrap();
        for _ in 0..10 {
            assert!(timers.advance().is_empty());
        }
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_kill_is_idempotent() {
        let mut timers = TickTimers::new(Duration::from_millis(10), 8);
        let token = timers
            .create(Duration::from_millis(10), EvictTarget::KnownKey(key(1)))
            .unwrap();
        timers.start(token).unwrap();
        timers.kill(token);
        timers.kill(token);
        assert!(timers.advance().is_empty());
    }

    #[test]
    fn test_pool_bound() {
        let mut timers = TickTimers::new(Duration::from_millis(10), 2);
        timers
            .create(Duration::from_millis(10), EvictTarget::KnownKey(key(1)))
            .unwrap();
        timers
            .create(Duration::from_millis(10), EvictTarget::KnownKey(key(2)))
            .unwrap();
        assert!(timers
            .create(Duration::from_millis(10), EvictTarget::KnownKey(key(3)))
            .is_err());
    }

    #[test]
    fn test_double_start_rejected() {
        let mut timers = TickTimers::new(Duration::from_millis(10), 8);
        let token = timers
            .create(Duration::from_millis(10), EvictTarget::KnownKey(key(1)))
            .unwrap();
        timers.start(token).unwrap();
        assert!(timers.start(token).is_err());
    }
}
