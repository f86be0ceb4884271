//! Scheduled sweep of stale hourly-ledger entries across all clients.
//!
//! Sessions expire their own entries client-side; the janitor is the
//! belt-and-suspenders pass that catches entries whose owning session died
//! before cleanup. It allows entries a full extra window past their expiry
//! so it never races a session that is still flushing.
//!
//! Driven externally on a cron-style cadence via `boopd janitor`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use serde_json::json;

use crate::auth::Authenticator;
use crate::constants::{BPH_ROOT, JANITOR_GRACE_MS, STORE_SESSION_UID};
use crate::ledger::parse_entry;
use crate::store::{StoreError, StoreHandle};

/// What one sweep looked at and did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Client subtrees visited.
    pub clients: usize,
    /// Ledger entries inspected.
    pub entries: usize,
    /// Removals issued (stale entries, malformed entries, non-map subtrees).
    pub scheduled: usize,
    /// Removals that failed (logged and swallowed).
    pub failures: usize,
}

/// Open a store session, sweep once, release the session.
pub async fn run(auth: &Authenticator) -> anyhow::Result<SweepStats> {
    let store = auth.signin(STORE_SESSION_UID).await?;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let stats = sweep(&store, now_ms).await?;
    log::info!(
        "janitor: {} clients, {} entries, {} removals ({} failed)",
        stats.clients,
        stats.entries,
        stats.scheduled,
        stats.failures
    );
    Ok(stats)
}

/// One sweep of the ledger root at time `now_ms`.
///
/// A malformed entry is scheduled for removal and the sweep continues with
/// the rest of the subtree; per-removal failures are logged and swallowed.
pub async fn sweep(store: &StoreHandle, now_ms: u64) -> Result<SweepStats, StoreError> {
    let mut stats = SweepStats::default();

    let root = match store.get(BPH_ROOT).await? {
        Some(root) => root,
        None => {
            store.set(BPH_ROOT, json!({})).await?;
            return Ok(stats);
        }
    };
    let Some(clients) = root.as_object() else {
        log::warn!("{BPH_ROOT} is not a map, resetting");
        store.set(BPH_ROOT, json!({})).await?;
        return Ok(stats);
    };

    let mut doomed: Vec<String> = Vec::new();
    for (client, entries) in clients {
        stats.clients += 1;
        let Some(entries) = entries.as_object() else {
            log::warn!("ledger subtree for {client} is not a map, removing");
            doomed.push(format!("{BPH_ROOT}/{client}"));
            continue;
        };
        for (key, value) in entries {
            stats.entries += 1;
            let path = format!("{BPH_ROOT}/{client}/{key}");
            match parse_entry(value) {
                None => {
                    log::warn!("malformed ledger entry {path}, removing");
                    doomed.push(path);
                }
                Some(entry) if entry.valid_until + JANITOR_GRACE_MS < now_ms => {
                    doomed.push(path);
                }
                Some(_) => {}
            }
        }
    }

    stats.scheduled = doomed.len();
    let results = join_all(doomed.into_iter().map(|path| {
        let store = Arc::clone(store);
        async move {
            match store.remove(&path).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("janitor failed to remove {path}: {e}");
                    false
                }
            }
        }
    }))
    .await;
    stats.failures = results.iter().filter(|ok| !**ok).count();

    Ok(stats)
}
