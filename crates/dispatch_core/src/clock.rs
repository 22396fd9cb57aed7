//! Time sources and the offer deadline queue.
//!
//! All timestamps are epoch milliseconds. The engine never sleeps: waiting for a
//! driver is an `expires_at` deadline checked lazily or by a periodic sweep.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::OfferId;

pub const ONE_SEC_MS: u64 = 1000;

/// Source of "now" for every engine decision.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests, demos and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now.store(now_ms, AtomicOrdering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs * ONE_SEC_MS);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub expires_at: u64,
    pub offer_id: OfferId,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by deadline.
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.offer_id.cmp(&self.offer_id))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Offer deadlines ordered earliest first.
///
/// Entries are never removed on resolution; consumers skip offers that are no
/// longer pending when they pop them.
#[derive(Debug, Default, Clone)]
pub struct DeadlineQueue {
    deadlines: BinaryHeap<Deadline>,
}

impl DeadlineQueue {
    pub fn schedule(&mut self, offer_id: OfferId, expires_at: u64) {
        self.deadlines.push(Deadline {
            expires_at,
            offer_id,
        });
    }

    /// Pop every deadline strictly before `now_ms`, earliest first.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<Deadline> {
        let mut due = Vec::new();
        while let Some(next) = self.deadlines.peek() {
            if next.expires_at >= now_ms {
                break;
            }
            if let Some(deadline) = self.deadlines.pop() {
                due.push(deadline);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.peek().map(|d| d.expires_at)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_pop_in_time_order() {
        let mut queue = DeadlineQueue::default();
        let (a, b, c) = (OfferId::new(), OfferId::new(), OfferId::new());
        queue.schedule(a, 10_000);
        queue.schedule(b, 5_000);
        queue.schedule(c, 20_000);
        assert_eq!(queue.next_deadline(), Some(5_000));

        let due = queue.pop_due(15_000);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].offer_id, b);
        assert_eq!(due[1].offer_id, a);
        assert_eq!(queue.len(), 1);

        // A deadline equal to now is not yet due.
        assert!(queue.pop_due(20_000).is_empty());
        assert_eq!(queue.pop_due(20_001)[0].offer_id, c);
        assert!(queue.is_empty());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_secs(30);
        assert_eq!(clock.now_ms(), 31_000);
        clock.set_ms(5);
        assert_eq!(clock.now_ms(), 5);
    }
}
