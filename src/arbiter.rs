use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::model::{now_ms, Ms, SlotId};

#[derive(Debug)]
pub enum ArbiterError {
    Unavailable(String),
}

impl std::fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArbiterError::Unavailable(e) => write!(f, "arbiter unavailable: {e}"),
        }
    }
}

impl std::error::Error for ArbiterError {}

/// Shared counter-with-TTL used to provisionally hold slots for the length of
/// one booking attempt.
///
/// Deliberately disposable: the durable booked count is the source of truth
/// for committed bookings; this state only narrows the check-then-act window
/// between reading a slot's count and committing against it. Any shared KV
/// store with atomic incr/decr and per-key expiry fits behind this trait.
#[async_trait]
pub trait ReservationArbiter: Send + Sync {
    /// Atomically increment the hold counter for a slot and return the new
    /// count. The TTL is armed only on the 0→1 transition, so a hold
    /// abandoned by a dead client self-expires.
    async fn hold(&self, slot_id: SlotId) -> Result<u32, ArbiterError>;

    /// Atomically decrement the counter, never below zero.
    async fn release(&self, slot_id: SlotId) -> Result<(), ArbiterError>;
}

struct HoldEntry {
    count: u32,
    expires_at: Ms,
}

/// In-process arbiter: per-slot counters in a `DashMap`, expiry swept by the
/// reaper task.
pub struct InMemoryArbiter {
    holds: DashMap<SlotId, HoldEntry>,
    ttl_ms: Ms,
}

impl InMemoryArbiter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            holds: DashMap::new(),
            ttl_ms: ttl.as_millis() as Ms,
        }
    }

    fn hold_at(&self, slot_id: SlotId, now: Ms) -> u32 {
        match self.holds.entry(slot_id) {
            Entry::Occupied(mut e) => {
                let h = e.get_mut();
                if h.expires_at <= now {
                    // Stale leftover from a dead attempt — start over.
                    h.count = 1;
                    h.expires_at = now + self.ttl_ms;
                } else {
                    h.count += 1;
                }
                h.count
            }
            Entry::Vacant(v) => {
                v.insert(HoldEntry {
                    count: 1,
                    expires_at: now + self.ttl_ms,
                });
                1
            }
        }
    }

    fn release_one(&self, slot_id: SlotId) {
        if let Entry::Occupied(mut e) = self.holds.entry(slot_id) {
            let h = e.get_mut();
            h.count = h.count.saturating_sub(1);
            if h.count == 0 {
                e.remove();
            }
        }
    }

    /// Current counter for a slot (0 when no entry exists).
    pub fn hold_count(&self, slot_id: SlotId) -> u32 {
        self.holds.get(&slot_id).map(|h| h.count).unwrap_or(0)
    }

    /// Drop every entry whose TTL has passed. Returns how many were swept.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let before = self.holds.len();
        self.holds.retain(|_, h| h.expires_at > now);
        before.saturating_sub(self.holds.len())
    }
}

#[async_trait]
impl ReservationArbiter for InMemoryArbiter {
    async fn hold(&self, slot_id: SlotId) -> Result<u32, ArbiterError> {
        metrics::counter!(crate::observability::HOLDS_TOTAL).increment(1);
        Ok(self.hold_at(slot_id, now_ms()))
    }

    async fn release(&self, slot_id: SlotId) -> Result<(), ArbiterError> {
        self.release_one(slot_id);
        Ok(())
    }
}
