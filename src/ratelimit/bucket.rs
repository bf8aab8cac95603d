//! Persisted token bucket state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Token bucket record shared by every process through the store.
///
/// All times are store-clock milliseconds. A state whose
/// `next_free_ticket_millis` lies before `now` is stale: it must be
/// [`resync`](TokenBucketState::resync)ed before its permits are read, which
/// every operation here does itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketState {
    max_permits: i64,
    stored_permits: i64,
    interval_millis: i64,
    next_free_ticket_millis: i64,
}

/// Longest TTL ever put on persisted state. Saturated reservations would
/// otherwise ask for an expiry the store cannot represent.
pub const MAX_STATE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Capacity and refill interval for a rate and burst window.
pub(crate) fn bucket_limits(permits_per_second: f64, max_burst_seconds: u32) -> (i64, i64) {
    let max_permits = (permits_per_second * f64::from(max_burst_seconds)) as i64;
    let interval_millis = (1000.0 / permits_per_second) as i64;
    (max_permits, interval_millis)
}

impl TokenBucketState {
    /// A fresh bucket holding one second worth of permits.
    pub fn seeded(permits_per_second: f64, max_burst_seconds: u32, now: i64) -> Self {
        let (max_permits, interval_millis) = bucket_limits(permits_per_second, max_burst_seconds);
        Self {
            max_permits,
            stored_permits: (permits_per_second as i64).clamp(0, max_permits.max(0)),
            interval_millis: interval_millis.max(1),
            next_free_ticket_millis: now,
        }
    }

    pub fn max_permits(&self) -> i64 {
        self.max_permits
    }

    pub fn stored_permits(&self) -> i64 {
        self.stored_permits
    }

    pub fn interval_millis(&self) -> i64 {
        self.interval_millis
    }

    pub fn next_free_ticket_millis(&self) -> i64 {
        self.next_free_ticket_millis
    }

    /// Credit permits accrued since the last reservation.
    ///
    /// Returns `true` if the state changed. Calling it again with the same
    /// `now` is a no-op.
    pub fn resync(&mut self, now: i64) -> bool {
        if now <= self.next_free_ticket_millis {
            return false;
        }

        let accrued = now.saturating_sub(self.next_free_ticket_millis) / self.interval_millis;
        self.stored_permits = self
            .stored_permits
            .saturating_add(accrued)
            .min(self.max_permits);
        self.next_free_ticket_millis = now;
        true
    }

    /// Split a request into banked permits and the wait for the remainder.
    fn split(&self, tokens: i64) -> (i64, i64) {
        let from_store = tokens.min(self.stored_permits);
        let fresh = tokens - from_store;
        (from_store, fresh.saturating_mul(self.interval_millis))
    }

    /// Milliseconds a reservation of `tokens` at `now` would have to wait,
    /// without committing anything.
    pub fn query_wait(&self, tokens: i64, now: i64) -> i64 {
        let mut projected = *self;
        projected.resync(now);
        let (_, wait_millis) = projected.split(tokens);
        projected
            .next_free_ticket_millis
            .saturating_sub(now)
            .saturating_add(wait_millis)
    }

    /// Reserve `tokens` at `now` and return how long the caller must wait.
    ///
    /// Banked permits are spent first; the rest are borrowed from the future
    /// by pushing `next_free_ticket_millis` forward, so later callers queue
    /// behind this one. Never negative.
    pub fn reserve(&mut self, tokens: i64, now: i64) -> i64 {
        self.resync(now);
        let (from_store, wait_millis) = self.split(tokens);

        self.next_free_ticket_millis = self.next_free_ticket_millis.saturating_add(wait_millis);
        self.stored_permits -= from_store;

        self.next_free_ticket_millis.saturating_sub(now).max(0)
    }

    /// Adopt a new capacity and interval, clamping banked permits.
    ///
    /// [`resync`](TokenBucketState::resync) first, so time already elapsed is
    /// credited at the old interval.
    ///
    /// Returns `true` if anything changed.
    pub fn reconfigure(&mut self, max_permits: i64, interval_millis: i64) -> bool {
        if self.max_permits == max_permits && self.interval_millis == interval_millis {
            return false;
        }

        self.max_permits = max_permits;
        self.interval_millis = interval_millis.max(1);
        self.stored_permits = self.stored_permits.min(max_permits).max(0);
        true
    }

    /// Store TTL: `floor` plus however far reservations reach past `now`,
    /// capped at [`MAX_STATE_TTL`].
    pub fn ttl(&self, now: i64, floor: Duration) -> Duration {
        let ahead_millis = self.next_free_ticket_millis.saturating_sub(now).max(0) as u64;
        floor
            .saturating_add(Duration::from_secs(ahead_millis.div_ceil(1000)))
            .min(MAX_STATE_TTL)
    }

    /// Whether a decoded record satisfies the bucket invariants.
    pub fn is_well_formed(&self) -> bool {
        self.interval_millis > 0
            && self.max_permits >= 0
            && (0..=self.max_permits).contains(&self.stored_permits)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
