//! Coalesced sync of local increments against the shared global counter.
//!
//! Admitted boops accumulate locally and are flushed as a single atomic
//! add at most once per [`GBC_SYNC_INTERVAL_MS`]. The session keeps at
//! most one add in flight; triggers that arrive while one is pending are
//! coalesced into the next decision. The displayed count is optimistic:
//! `last_gbc + unsynced` hides write latency from the client.

use serde_json::Value;

use crate::constants::GBC_SYNC_INTERVAL_MS;

/// Local shadow of the shared counter plus unflushed increments.
#[derive(Debug)]
pub struct CounterSync {
    last_gbc: u64,
    unsynced: u64,
    last_sync_ms: u64,
}

/// What an external counter snapshot did to the local shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// Absent or unchanged value; nothing to tell the client.
    Ignored,
    /// The stored value is not a non-negative integer; caller logs it.
    NonNumeric,
    /// The shadow moved; send the client this displayed count.
    Updated(u64),
}

impl CounterSync {
    /// Seed from the initial stored value. `now_ms` starts the sync-interval
    /// clock so a fresh session does not write immediately.
    pub fn new(initial: u64, now_ms: u64) -> Self {
        Self {
            last_gbc: initial,
            unsynced: 0,
            last_sync_ms: now_ms,
        }
    }

    /// The count shown to this client: store shadow plus unflushed boops.
    pub fn displayed(&self) -> u64 {
        self.last_gbc + self.unsynced
    }

    /// Most recent value observed from (or optimistically applied to) the
    /// store.
    pub fn last_gbc(&self) -> u64 {
        self.last_gbc
    }

    /// Increments not yet covered by an issued atomic add.
    pub fn unsynced(&self) -> u64 {
        self.unsynced
    }

    /// Count one admitted boop.
    pub fn record_boop(&mut self) {
        self.unsynced += 1;
    }

    /// Decide whether to issue an atomic add now.
    ///
    /// Returns the delta to write, after folding it into the local shadow
    /// so the displayed count is unaffected by the write's latency. The
    /// caller must hold at most one write in flight and report back through
    /// [`complete_sync`](Self::complete_sync).
    pub fn begin_sync(&mut self, now_ms: u64, final_sync: bool) -> Option<u64> {
        if self.unsynced == 0 {
            return None;
        }
        if !final_sync && now_ms.saturating_sub(self.last_sync_ms) < GBC_SYNC_INTERVAL_MS {
            return None;
        }
        let change = std::mem::take(&mut self.unsynced);
        self.last_gbc += change;
        self.last_sync_ms = now_ms;
        Some(change)
    }

    /// Record the outcome of an issued add. A failed write puts the delta
    /// back for the next retry (the shadow stays advanced; the next store
    /// snapshot reconciles the display). Returns whether another full
    /// interval has already elapsed with increments pending, in which case
    /// the caller re-enters immediately.
    pub fn complete_sync(&mut self, now_ms: u64, ok: bool, change: u64) -> bool {
        if !ok {
            self.unsynced += change;
        }
        self.unsynced != 0
            && now_ms.saturating_sub(self.last_sync_ms) >= GBC_SYNC_INTERVAL_MS
    }

    /// Fold in a counter snapshot pushed by the store.
    pub fn observe_remote(&mut self, value: &Value) -> RemoteUpdate {
        if value.is_null() {
            // Counter not created yet; the first flush will create it.
            return RemoteUpdate::Ignored;
        }
        let Some(observed) = value.as_u64() else {
            return RemoteUpdate::NonNumeric;
        };
        if observed == self.last_gbc {
            return RemoteUpdate::Ignored;
        }
        self.last_gbc = observed;
        RemoteUpdate::Updated(self.displayed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_fresh_session_does_not_write_immediately() {
        let mut counter = CounterSync::new(42, T0);
        counter.record_boop();
        assert_eq!(counter.begin_sync(T0 + 10, false), None);
        assert_eq!(counter.displayed(), 43);
    }

    #[test]
    fn test_increments_coalesce_into_one_write_per_interval() {
        let mut counter = CounterSync::new(0, T0);
        counter.record_boop();
        counter.record_boop();
        counter.record_boop();

        assert_eq!(counter.begin_sync(T0 + 100, false), None);
        assert_eq!(counter.begin_sync(T0 + 250, false), Some(3));
        assert_eq!(counter.displayed(), 3);

        // New increments inside the fresh interval wait for the next slot.
        counter.record_boop();
        assert_eq!(counter.begin_sync(T0 + 300, false), None);
        assert_eq!(counter.begin_sync(T0 + 500, false), Some(1));
    }

    #[test]
    fn test_final_sync_ignores_the_interval() {
        let mut counter = CounterSync::new(0, T0);
        counter.record_boop();
        assert_eq!(counter.begin_sync(T0 + 1, true), Some(1));
        // Nothing pending: final sync is a no-op too.
        assert_eq!(counter.begin_sync(T0 + 2, true), None);
    }

    #[test]
    fn test_failed_write_restores_the_delta() {
        let mut counter = CounterSync::new(10, T0);
        counter.record_boop();
        counter.record_boop();
        let change = counter.begin_sync(T0 + 300, false).unwrap();
        assert_eq!(counter.unsynced(), 0);

        let reenter = counter.complete_sync(T0 + 320, false, change);
        assert!(!reenter, "interval has not elapsed since the attempt");
        assert_eq!(counter.unsynced(), 2);

        // The retry goes out on the next slot.
        assert_eq!(counter.begin_sync(T0 + 600, false), Some(2));
    }

    #[test]
    fn test_slow_write_reenters_when_backlog_waits() {
        let mut counter = CounterSync::new(0, T0);
        counter.record_boop();
        let change = counter.begin_sync(T0 + 250, false).unwrap();

        counter.record_boop();
        // The write took longer than an interval and a boop is waiting.
        assert!(counter.complete_sync(T0 + 600, true, change));
    }

    #[test]
    fn test_observe_remote_dedups_and_updates() {
        let mut counter = CounterSync::new(42, T0);
        assert_eq!(counter.observe_remote(&json!(null)), RemoteUpdate::Ignored);
        assert_eq!(counter.observe_remote(&json!(42)), RemoteUpdate::Ignored);
        assert_eq!(counter.observe_remote(&json!("x")), RemoteUpdate::NonNumeric);
        assert_eq!(counter.observe_remote(&json!(50)), RemoteUpdate::Updated(50));

        counter.record_boop();
        assert_eq!(counter.observe_remote(&json!(60)), RemoteUpdate::Updated(61));
    }
}
