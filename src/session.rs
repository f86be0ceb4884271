//! Per-connection session machine.
//!
//! One tokio task owns everything a connected client needs:
//!
//! ```text
//! Session
//!     ├── channel (inbound frames, fire-and-forget outbound)
//!     ├── heartbeat watchdog (close 1001 on starvation)
//!     ├── RateLimiter ← BphLedger (admission, cooldowns, close 1002 on abuse)
//!     ├── CounterSync (single-flight coalesced atomic adds)
//!     ├── ledger subscription + per-entry expiry timers (DelayQueue)
//!     └── shutdown flush (final add + ledger append, bounded window)
//! ```
//!
//! All state is private to the task; store callbacks arrive as subscription
//! events in the same select loop, so handlers never race each other.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::OptionFuture;
use serde_json::{json, Value};
use tokio_util::time::delay_queue::{DelayQueue, Key as DelayKey};

use crate::auth::Authenticator;
use crate::channel::{ChannelEvent, SessionChannel};
use crate::client_id::ClientId;
use crate::constants::{
    BPH_ROOT, BPH_SYNC_INTERVAL_MS, BPH_WINDOW_MS, CD_FAIL_LIMIT, CLOSE_COOLDOWN_ABUSE,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_INTERNAL_ERROR, GBC_PATH, GBC_SYNC_INTERVAL_MS,
    HEARTBEAT_TIMEOUT_MS, REASON_COOLDOWN_ABUSE, REASON_HEARTBEAT_TIMEOUT,
    REASON_INTERNAL_ERROR, SHUTDOWN_FLUSH_TIMEOUT_MS, STORE_SESSION_UID,
};
use crate::counter::{CounterSync, RemoteUpdate};
use crate::ledger::{AppliedChild, BphEntry, BphLedger};
use crate::limiter::RateLimiter;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::store::{
    bph_entry_path, bph_path, ChildEvent, ChildStream, StoreError, StoreHandle, ValueStream,
};

/// Wall-clock anchored to the tokio clock, so paused-clock tests drive
/// every window deterministically.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    base_ms: u64,
    origin: tokio::time::Instant,
}

impl SessionClock {
    /// Capture the current wall clock against the tokio clock.
    pub fn start() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            base_ms,
            origin: tokio::time::Instant::now(),
        }
    }

    /// Current time, epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.base_ms + self.origin.elapsed().as_millis() as u64
    }

    /// The tokio instant corresponding to an epoch-millisecond stamp.
    /// Stamps before the session started map to the start.
    pub fn instant_at(&self, at_ms: u64) -> tokio::time::Instant {
        self.origin + Duration::from_millis(at_ms.saturating_sub(self.base_ms))
    }
}

/// An issued atomic add that has not completed yet.
struct InflightAdd {
    fut: Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>,
    change: u64,
}

impl std::fmt::Debug for InflightAdd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightAdd")
            .field("change", &self.change)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoopDisposition {
    Continue,
    CloseAbuse,
}

/// Live server-side state for one connected client.
pub struct Session {
    client_id: ClientId,
    channel: SessionChannel,
    store: StoreHandle,
    clock: SessionClock,
    limiter: RateLimiter,
    ledger: BphLedger,
    counter: CounterSync,
    cooldown_until: u64,
    cooldown_fails: u32,
    reentry_logged: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("cooldown_until", &self.cooldown_until)
            .field("cooldown_fails", &self.cooldown_fails)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Run a session over an accepted channel until it closes, then flush.
    ///
    /// Initialization failures close the channel with 1000; everything after
    /// that is non-fatal to the connection.
    pub async fn run(client_id: ClientId, channel: SessionChannel, auth: Arc<Authenticator>) {
        match Self::initialize(client_id.clone(), channel, auth).await {
            Ok((session, bph_events, gbc_events)) => {
                session.drive(bph_events, gbc_events).await;
            }
            Err((channel, err)) => {
                log::error!("[{client_id}] initialization failed: {err}");
                channel.close(CLOSE_INTERNAL_ERROR, REASON_INTERNAL_ERROR);
            }
        }
    }

    async fn initialize(
        client_id: ClientId,
        channel: SessionChannel,
        auth: Arc<Authenticator>,
    ) -> Result<(Self, ChildStream, ValueStream), (SessionChannel, anyhow::Error)> {
        let clock = SessionClock::start();
        let init = async {
            let store = auth.signin(STORE_SESSION_UID).await?;
            let ((bph_events, ledger), (gbc_events, initial)) = tokio::try_join!(
                Self::init_ledger(&store, &client_id),
                Self::init_counter(&store),
            )?;
            anyhow::Ok((store, bph_events, ledger, gbc_events, initial))
        };

        match init.await {
            Ok((store, bph_events, ledger, gbc_events, initial)) => {
                let counter = CounterSync::new(initial, clock.now_ms());
                channel.send(&ServerFrame::Count(counter.last_gbc()));
                let session = Self {
                    client_id,
                    channel,
                    store,
                    clock,
                    limiter: RateLimiter::new(),
                    ledger,
                    counter,
                    cooldown_until: 0,
                    cooldown_fails: 0,
                    reentry_logged: false,
                };
                Ok((session, bph_events, gbc_events))
            }
            Err(err) => Err((channel, err)),
        }
    }

    /// Subscribe to the client's ledger subtree, make sure both the root
    /// and the subtree are maps, and mirror the initial snapshot.
    async fn init_ledger(
        store: &StoreHandle,
        client_id: &ClientId,
    ) -> anyhow::Result<(ChildStream, BphLedger)> {
        let path = bph_path(client_id);
        let events = store.subscribe_children(&path).await?;

        if let Some(root) = store.get(BPH_ROOT).await? {
            if !root.is_object() {
                log::warn!("{BPH_ROOT} is not a map, resetting");
                store.set(BPH_ROOT, json!({})).await?;
            }
        }

        let snapshot = match store.get(&path).await? {
            Some(value) if value.is_object() => value,
            Some(_) => {
                log::warn!("[{client_id}] ledger subtree is not a map, resetting");
                store.set(&path, json!({})).await?;
                json!({})
            }
            None => {
                store.set(&path, json!({})).await?;
                json!({})
            }
        };

        let mut ledger = BphLedger::new();
        if let Some(entries) = snapshot.as_object() {
            for (key, value) in entries {
                // Malformed snapshot entries are skipped here; the
                // subscription replay routes them through removal.
                if ledger.apply_added(key, value) == AppliedChild::Malformed {
                    log::debug!("[{client_id}] skipping malformed snapshot entry {key}");
                }
            }
        }
        Ok((events, ledger))
    }

    /// Subscribe to the shared counter and read its initial value.
    async fn init_counter(store: &StoreHandle) -> anyhow::Result<(ValueStream, u64)> {
        let events = store.subscribe_value(GBC_PATH).await?;
        let initial = match store.get(GBC_PATH).await? {
            None => 0,
            Some(value) => value.as_u64().unwrap_or_else(|| {
                log::warn!("non-numeric value at {GBC_PATH}: {value}");
                0
            }),
        };
        Ok((events, initial))
    }

    async fn drive(mut self, mut bph_events: ChildStream, mut gbc_events: ValueStream) {
        log::info!(
            "[{}] session started (count={})",
            self.client_id,
            self.counter.last_gbc()
        );

        // Client-side expiry timers for mirrored ledger entries.
        let mut expiry: DelayQueue<String> = DelayQueue::new();
        let mut expiry_keys: HashMap<String, DelayKey> = HashMap::new();
        for (key, entry) in self.ledger.iter() {
            let handle = expiry.insert_at(key.clone(), self.clock.instant_at(entry.valid_until));
            expiry_keys.insert(key.clone(), handle);
        }

        let mut inflight: Option<InflightAdd> = None;

        let heartbeat = tokio::time::sleep(Duration::from_millis(HEARTBEAT_TIMEOUT_MS));
        tokio::pin!(heartbeat);

        let gbc_period = Duration::from_millis(GBC_SYNC_INTERVAL_MS);
        let mut gbc_timer = tokio::time::interval_at(tokio::time::Instant::now() + gbc_period, gbc_period);
        let bph_period = Duration::from_millis(BPH_SYNC_INTERVAL_MS);
        let mut bph_timer = tokio::time::interval_at(tokio::time::Instant::now() + bph_period, bph_period);

        loop {
            tokio::select! {
                biased;

                () = &mut heartbeat => {
                    log::info!(
                        "[{}] no heartbeat within {HEARTBEAT_TIMEOUT_MS}ms, closing",
                        self.client_id
                    );
                    self.channel.close(CLOSE_HEARTBEAT_TIMEOUT, REASON_HEARTBEAT_TIMEOUT);
                    break;
                }

                Some(result) = OptionFuture::from(inflight.as_mut().map(|add| add.fut.as_mut())) => {
                    let add = inflight.take().expect("completed add was in flight");
                    self.finish_gbc_write(&mut inflight, add.change, result);
                }

                event = self.channel.recv() => {
                    match event {
                        Some(ChannelEvent::Text(text)) => match ClientFrame::decode(&text) {
                            Err(_) => {
                                log::warn!("[{}] malformed frame {text:?}", self.client_id);
                                self.channel.send(&ServerFrame::InvalidFrame);
                            }
                            Ok(ClientFrame::Heartbeat) => {
                                heartbeat.as_mut().reset(
                                    tokio::time::Instant::now()
                                        + Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
                                );
                                self.channel.send(&ServerFrame::Heartbeat);
                            }
                            Ok(ClientFrame::Boop(boop_id)) => {
                                if self.handle_boop(boop_id, &mut inflight)
                                    == BoopDisposition::CloseAbuse
                                {
                                    self.channel
                                        .close(CLOSE_COOLDOWN_ABUSE, REASON_COOLDOWN_ABUSE);
                                    break;
                                }
                            }
                            Ok(ClientFrame::CooldownQuery(query_id)) => {
                                self.handle_query(query_id);
                            }
                        },
                        Some(ChannelEvent::Binary(data)) => {
                            log::warn!(
                                "[{}] ignoring {}-byte binary frame",
                                self.client_id,
                                data.len()
                            );
                        }
                        None => break,
                    }
                }

                Some(event) = bph_events.next() => match event {
                    ChildEvent::Added { key, value } => {
                        self.handle_entry_added(&mut expiry, &mut expiry_keys, key, value);
                    }
                    ChildEvent::Removed { key } => {
                        self.handle_entry_removed(&mut expiry, &mut expiry_keys, &key);
                    }
                },

                Some(value) = gbc_events.next() => {
                    match self.counter.observe_remote(&value) {
                        RemoteUpdate::Ignored => {}
                        RemoteUpdate::NonNumeric => {
                            log::warn!(
                                "[{}] non-numeric value at {GBC_PATH}: {value}",
                                self.client_id
                            );
                        }
                        RemoteUpdate::Updated(displayed) => {
                            self.channel.send(&ServerFrame::Count(displayed));
                        }
                    }
                }

                Some(expired) = std::future::poll_fn(|cx| expiry.poll_expired(cx)) => {
                    let key = expired.into_inner();
                    expiry_keys.remove(&key);
                    log::debug!("[{}] ledger entry {key} expired", self.client_id);
                    self.remove_entry_later(&key);
                }

                _ = gbc_timer.tick() => {
                    let now = self.clock.now_ms();
                    self.launch_gbc_write(&mut inflight, now);
                }

                _ = bph_timer.tick() => {
                    self.sync_ledger().await;
                }
            }
        }

        self.shutdown(inflight, bph_events, gbc_events).await;
    }

    /// Admission per the two-window policy. Rejects carry the remaining
    /// cooldown; hammering during an active cooldown closes the channel.
    fn handle_boop(
        &mut self,
        boop_id: u64,
        inflight: &mut Option<InflightAdd>,
    ) -> BoopDisposition {
        let now = self.clock.now_ms();

        if self.cooldown_until != 0 && now < self.cooldown_until {
            if self.cooldown_fails >= CD_FAIL_LIMIT {
                log::warn!(
                    "[{}] {} rejects during active cooldown, closing",
                    self.client_id,
                    self.cooldown_fails
                );
                return BoopDisposition::CloseAbuse;
            }
            self.cooldown_fails += 1;
            self.channel.send(&ServerFrame::BoopRejected {
                boop_id,
                cooldown_ms: self.cooldown_until - now,
            });
            return BoopDisposition::Continue;
        }

        self.cooldown_until = 0;
        let cooldown_ms = self.limiter.cooldown(now, &self.ledger);
        if cooldown_ms > 0 {
            self.cooldown_until = now + cooldown_ms;
            self.channel.send(&ServerFrame::BoopRejected {
                boop_id,
                cooldown_ms,
            });
            return BoopDisposition::Continue;
        }

        self.cooldown_fails = 0;
        self.limiter.record(now);
        self.ledger.record_boop();
        self.counter.record_boop();
        self.launch_gbc_write(inflight, now);
        self.channel.send(&ServerFrame::BoopAccepted(boop_id));
        self.channel
            .send(&ServerFrame::Count(self.counter.displayed()));
        BoopDisposition::Continue
    }

    fn handle_query(&mut self, query_id: u64) {
        let now = self.clock.now_ms();
        let cooldown_ms = if self.cooldown_until > now {
            self.cooldown_until - now
        } else {
            self.limiter.cooldown(now, &self.ledger)
        };
        self.channel.send(&ServerFrame::CooldownReply {
            query_id,
            cooldown_ms,
        });
    }

    fn handle_entry_added(
        &mut self,
        expiry: &mut DelayQueue<String>,
        expiry_keys: &mut HashMap<String, DelayKey>,
        key: String,
        value: Value,
    ) {
        match self.ledger.apply_added(&key, &value) {
            AppliedChild::Malformed => {
                log::warn!(
                    "[{}] malformed ledger entry at {key:?}, removing",
                    self.client_id
                );
                self.remove_entry_later(&key);
            }
            AppliedChild::Tracked { valid_until } => {
                if let Some(handle) = expiry_keys.remove(&key) {
                    expiry.remove(&handle);
                }
                let handle = expiry.insert_at(key.clone(), self.clock.instant_at(valid_until));
                expiry_keys.insert(key, handle);
            }
        }
    }

    fn handle_entry_removed(
        &mut self,
        expiry: &mut DelayQueue<String>,
        expiry_keys: &mut HashMap<String, DelayKey>,
        key: &str,
    ) {
        if self.ledger.apply_removed(key).is_none() {
            log::warn!(
                "[{}] removal event for unknown ledger entry {key}",
                self.client_id
            );
            return;
        }
        if let Some(handle) = expiry_keys.remove(key) {
            expiry.remove(&handle);
        }
    }

    /// Fire-and-forget removal of one ledger entry. The mirror updates when
    /// the removal event echoes back through the subscription.
    fn remove_entry_later(&self, key: &str) {
        let store = Arc::clone(&self.store);
        let path = bph_entry_path(&self.client_id, key);
        tokio::spawn(async move {
            if let Err(e) = store.remove(&path).await {
                log::warn!("failed to remove ledger entry {path}: {e}");
            }
        });
    }

    /// Issue a coalesced counter write if one is due and none is in flight.
    fn launch_gbc_write(&mut self, inflight: &mut Option<InflightAdd>, now_ms: u64) {
        if inflight.is_some() {
            // Coalesced: the pending write's completion re-checks.
            return;
        }
        let Some(change) = self.counter.begin_sync(now_ms, false) else {
            return;
        };
        log::debug!("[{}] counter write +{change}", self.client_id);
        let store = Arc::clone(&self.store);
        *inflight = Some(InflightAdd {
            fut: Box::pin(async move { store.atomic_add(GBC_PATH, change as i64).await }),
            change,
        });
    }

    fn finish_gbc_write(
        &mut self,
        inflight: &mut Option<InflightAdd>,
        change: u64,
        result: Result<(), StoreError>,
    ) {
        let now = self.clock.now_ms();
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "[{}] counter write of +{change} failed, will retry: {e}",
                    self.client_id
                );
                false
            }
        };
        if self.counter.complete_sync(now, ok, change) {
            if !self.reentry_logged {
                log::debug!(
                    "[{}] counter write outlasted the sync interval, re-entering",
                    self.client_id
                );
                self.reentry_logged = true;
            }
            self.launch_gbc_write(inflight, now);
        }
    }

    /// Append unsynced admissions to the store-side hourly ledger.
    async fn sync_ledger(&mut self) {
        let Some(change) = self.ledger.take_unsynced() else {
            return;
        };
        let now = self.clock.now_ms();
        let entry = BphEntry {
            valid_until: now + BPH_WINDOW_MS,
            change,
        };
        match self
            .store
            .push(&bph_path(&self.client_id), entry.to_value())
            .await
        {
            Ok(key) => {
                log::debug!("[{}] ledger append {key} (+{change})", self.client_id);
            }
            Err(e) => {
                log::warn!(
                    "[{}] ledger append of +{change} failed, will retry: {e}",
                    self.client_id
                );
                self.ledger.restore_unsynced(change);
            }
        }
    }

    /// Tear down subscriptions, flush both unsynced tallies under a bounded
    /// window, release the store handle.
    async fn shutdown(
        mut self,
        mut inflight: Option<InflightAdd>,
        bph_events: ChildStream,
        gbc_events: ValueStream,
    ) {
        drop(bph_events);
        drop(gbc_events);

        // The flush pretends to be past the next sync slot so the final
        // write always goes out.
        let flush_now = self.clock.now_ms() + GBC_SYNC_INTERVAL_MS + 60_000;

        let flush = async {
            // Settle any in-flight write first: a failure folds its delta
            // into the final one.
            if let Some(add) = inflight.take() {
                let ok = match add.fut.await {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!(
                            "[{}] in-flight counter write of +{} failed during shutdown: {e}",
                            self.client_id,
                            add.change
                        );
                        false
                    }
                };
                self.counter.complete_sync(flush_now, ok, add.change);
            }

            let gbc_change = self.counter.begin_sync(flush_now, true);
            let entry = self.ledger.take_unsynced().map(|change| BphEntry {
                valid_until: self.clock.now_ms() + BPH_WINDOW_MS,
                change,
            });

            let store = Arc::clone(&self.store);
            let path = bph_path(&self.client_id);
            let gbc_task = async {
                match gbc_change {
                    Some(change) => store
                        .atomic_add(GBC_PATH, change as i64)
                        .await
                        .map_err(|e| (change, e)),
                    None => Ok(()),
                }
            };
            let ledger_task = async {
                match entry {
                    Some(entry) => store
                        .push(&path, entry.to_value())
                        .await
                        .map(|_| ())
                        .map_err(|e| (entry.change, e)),
                    None => Ok(()),
                }
            };
            let (gbc_result, ledger_result) = tokio::join!(gbc_task, ledger_task);
            if let Err((change, e)) = gbc_result {
                log::warn!(
                    "[{}] final counter write of +{change} lost: {e}",
                    self.client_id
                );
            }
            if let Err((change, e)) = ledger_result {
                log::warn!(
                    "[{}] final ledger append of +{change} lost: {e}",
                    self.client_id
                );
            }
        };

        let window = Duration::from_millis(SHUTDOWN_FLUSH_TIMEOUT_MS);
        if tokio::time::timeout(window, flush).await.is_err() {
            log::warn!(
                "[{}] shutdown flush window expired, unsynced state dropped",
                self.client_id
            );
        }

        log::info!("[{}] session ended", self.client_id);
        // Store handle released as `self` drops.
    }
}
