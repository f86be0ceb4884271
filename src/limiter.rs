//! Two-window admission control.
//!
//! The short (burst) window is a deque of recent admission timestamps held
//! entirely in session memory. The long (hourly) window is backed by the
//! store-ledgered [`BphLedger`], so it survives disconnects. `cooldown`
//! answers "how long until the next boop would be admitted" without
//! mutating admission state; `record` charges an admitted boop against the
//! burst window.

use std::collections::VecDeque;

use crate::constants::{BPH_LIMIT, BPH_WINDOW_MS, BPM_LIMIT, BPM_WINDOW_MS};
use crate::ledger::BphLedger;

/// Per-session admission state for the burst window.
#[derive(Debug, Default)]
pub struct RateLimiter {
    window: VecDeque<u64>,
}

impl RateLimiter {
    /// Empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds until a new boop would be admitted; 0 means admit now.
    ///
    /// The hourly window dominates: when the ledgered total (mirrored plus
    /// unsynced) is at the cap, the answer is the expiry of the earliest
    /// entries whose removal brings the total back under the cap. When no
    /// mirrored entries can do that (the excess is all unsynced), a full
    /// window is assumed.
    pub fn cooldown(&mut self, now: u64, ledger: &BphLedger) -> u64 {
        let total = ledger.hourly_total();
        if total >= BPH_LIMIT {
            let mut virtual_sum = total;
            let mut soonest = None;
            for entry in ledger.entries_by_expiry() {
                virtual_sum = virtual_sum.saturating_sub(entry.change);
                soonest = Some(entry.valid_until);
                if virtual_sum < BPH_LIMIT {
                    break;
                }
            }
            let soonest = match soonest {
                Some(at) if virtual_sum < BPH_LIMIT => at,
                _ => now + BPH_WINDOW_MS,
            };
            return soonest.saturating_sub(now);
        }

        if self.window.len() >= BPM_LIMIT {
            let oldest = *self.window.front().expect("window is non-empty");
            if now - oldest >= BPM_WINDOW_MS {
                self.prune(now);
                return 0;
            }
            return BPM_WINDOW_MS - (now - oldest);
        }

        0
    }

    /// Charge an admitted boop against the burst window.
    pub fn record(&mut self, now: u64) {
        self.prune(now);
        self.window.push_back(now);
    }

    /// Number of admissions currently inside the burst window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    fn prune(&mut self, now: u64) {
        while let Some(&oldest) = self.window.front() {
            if now - oldest >= BPM_WINDOW_MS {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
