//! Local mirror of one client's hourly ledger in the store.
//!
//! Each admitted boop eventually becomes (part of) a ledger entry
//! `[valid_until, change]` under the client's subtree. The mirror is fed by
//! child subscription events and carries the count of admissions that have
//! not been appended yet, so the hourly limit sees boops the store hasn't.
//!
//! Writes are snapshot-and-restore: a failed append puts the snapshot back
//! and the next scheduled sync retries.

use std::collections::HashMap;

use serde_json::{json, Value};

/// One hourly-ledger entry: `change` boops admitted, stale after
/// `valid_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BphEntry {
    /// Expiry, epoch milliseconds.
    pub valid_until: u64,
    /// Number of boops this entry accounts for.
    pub change: u64,
}

impl BphEntry {
    /// Stored representation: a 2-element array.
    pub fn to_value(self) -> Value {
        json!([self.valid_until, self.change])
    }
}

/// Strictly decode a stored ledger entry.
///
/// Anything but a 2-element array of non-negative integers with a positive
/// expiry is malformed and gets scheduled for removal by the caller.
pub fn parse_entry(value: &Value) -> Option<BphEntry> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let valid_until = arr[0].as_u64()?;
    let change = arr[1].as_u64()?;
    if valid_until == 0 {
        return None;
    }
    Some(BphEntry {
        valid_until,
        change,
    })
}

/// Outcome of applying a child-added event to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChild {
    /// The entry is now mirrored; schedule its client-side expiry.
    Tracked {
        /// Expiry to schedule, epoch milliseconds.
        valid_until: u64,
    },
    /// The stored value did not decode; the mirror was not touched and the
    /// offending key should be removed from the store.
    Malformed,
}

/// Mirror of this client's ledger subtree plus unsynced admissions.
#[derive(Debug, Default)]
pub struct BphLedger {
    mirror: HashMap<String, BphEntry>,
    sum: u64,
    unsynced: u64,
}

impl BphLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a child-added event. Re-adding a known key replaces its entry,
    /// keeping the mirrored sum consistent.
    pub fn apply_added(&mut self, key: &str, value: &Value) -> AppliedChild {
        let Some(entry) = parse_entry(value) else {
            return AppliedChild::Malformed;
        };
        if let Some(old) = self.mirror.insert(key.to_string(), entry) {
            self.sum -= old.change;
        }
        self.sum += entry.change;
        AppliedChild::Tracked {
            valid_until: entry.valid_until,
        }
    }

    /// Apply a child-removed event. `None` means the key was not mirrored
    /// and the caller should log a warning.
    pub fn apply_removed(&mut self, key: &str) -> Option<BphEntry> {
        let entry = self.mirror.remove(key)?;
        self.sum -= entry.change;
        Some(entry)
    }

    /// Count one admitted boop that has not been appended yet.
    pub fn record_boop(&mut self) {
        self.unsynced += 1;
    }

    /// Boops charged against the hourly window: mirrored plus unsynced.
    pub fn hourly_total(&self) -> u64 {
        self.sum + self.unsynced
    }

    /// Sum of `change` across the mirror.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Admissions not yet appended to the store.
    pub fn unsynced(&self) -> u64 {
        self.unsynced
    }

    /// Snapshot and zero the unsynced count for an append. Returns `None`
    /// when there is nothing to append.
    pub fn take_unsynced(&mut self) -> Option<u64> {
        if self.unsynced == 0 {
            return None;
        }
        Some(std::mem::take(&mut self.unsynced))
    }

    /// Put a failed append's snapshot back for the next retry.
    pub fn restore_unsynced(&mut self, change: u64) {
        self.unsynced += change;
    }

    /// Mirrored entries sorted ascending by expiry.
    pub fn entries_by_expiry(&self) -> Vec<BphEntry> {
        let mut entries: Vec<BphEntry> = self.mirror.values().copied().collect();
        entries.sort_by_key(|e| e.valid_until);
        entries
    }

    /// Iterate mirrored `(key, entry)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BphEntry)> {
        self.mirror.iter()
    }

    /// Whether `key` is mirrored.
    pub fn contains(&self, key: &str) -> bool {
        self.mirror.contains_key(key)
    }
}
