//! End-to-end session scenarios against the in-process store.
//!
//! Every test runs with the tokio clock paused, so rate windows, heartbeat
//! deadlines, and sync intervals are driven deterministically with
//! `tokio::time::advance`. The store-seeded timestamps use the real wall
//! clock, which can drift a few milliseconds from the session's captured
//! base, so assertions against seeded expiries allow a small tolerance.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use boopd::auth::{Authenticator, StaticStoreOpener, StaticTokenMinter};
use boopd::channel::{self, ChannelOutput, ChannelRemote};
use boopd::protocol::{encode_int, ServerFrame};
use boopd::store::{MemoryStore, Store, StoreHandle};
use boopd::{ClientId, Session};
use serde_json::json;
use tokio::task::JoinHandle;

const CLIENT: &str = "client-a";

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn authenticator(store: &Arc<MemoryStore>) -> Arc<Authenticator> {
    let handle: StoreHandle = Arc::clone(store) as StoreHandle;
    Arc::new(Authenticator::new(
        Arc::new(StaticTokenMinter),
        Arc::new(StaticStoreOpener::new(handle)),
        "test",
    ))
}

async fn connect(store: &Arc<MemoryStore>) -> (ChannelRemote, JoinHandle<()>) {
    let (session_channel, remote) = channel::pair(2048);
    let session = tokio::spawn(Session::run(
        ClientId::from(CLIENT),
        session_channel,
        authenticator(store),
    ));
    (remote, session)
}

async fn expect_raw(remote: &mut ChannelRemote) -> String {
    match remote.next_output().await {
        Some(ChannelOutput::Frame(text)) => text,
        other => panic!("expected a frame, got {other:?}"),
    }
}

async fn expect_frame(remote: &mut ChannelRemote) -> ServerFrame {
    let raw = expect_raw(remote).await;
    ServerFrame::decode(&raw).unwrap_or_else(|_| panic!("undecodable frame {raw:?}"))
}

async fn expect_close(remote: &mut ChannelRemote) -> (u16, String) {
    loop {
        match remote.next_output().await {
            Some(ChannelOutput::Close { code, reason }) => return (code, reason),
            Some(ChannelOutput::Frame(text)) => panic!("expected close, got frame {text:?}"),
            None => panic!("expected close, channel ended"),
        }
    }
}

/// Poll the store until `check` passes, yielding to let the session run.
async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool>>>,
{
    for _ in 0..10_000 {
        if check().await {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("timed out waiting for {what}");
}

async fn advance_with_heartbeats(remote: &mut ChannelRemote, total_ms: u64) {
    // Keep the watchdog fed while crossing long windows.
    let step = 20_000;
    let mut remaining = total_ms;
    while remaining > 0 {
        let chunk = remaining.min(step);
        tokio::time::advance(Duration::from_millis(chunk)).await;
        remaining -= chunk;
        assert!(remote.send_text("h").await);
        assert_eq!(expect_frame(remote).await, ServerFrame::Heartbeat);
    }
}

// ========== Scenario: cold open ==========

#[tokio::test(start_paused = true)]
async fn test_cold_open_replays_count_and_admits() {
    let store = Arc::new(MemoryStore::new());
    store.set("gbc", json!(42)).await.unwrap();
    let (mut remote, _session) = connect(&store).await;

    // 42 in base-36 is "16".
    assert_eq!(expect_raw(&mut remote).await, "c16");

    assert!(remote.send_text("d1").await);
    assert_eq!(expect_raw(&mut remote).await, "d1");

    assert!(remote.send_text("b1").await);
    assert_eq!(expect_raw(&mut remote).await, "b1");
    assert_eq!(expect_raw(&mut remote).await, "c17");
}

// ========== Scenario: BPM burst ==========

#[tokio::test(start_paused = true)]
async fn test_burst_past_bpm_limit_rejects_with_remaining_window() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    for i in 1..=1000u64 {
        assert!(remote.send_text(format!("b{}", encode_int(i))).await);
    }
    for i in 1..=1000u64 {
        assert_eq!(expect_frame(&mut remote).await, ServerFrame::BoopAccepted(i));
        assert_eq!(expect_frame(&mut remote).await, ServerFrame::Count(i));
    }

    tokio::time::advance(Duration::from_millis(50)).await;
    assert!(remote.send_text(format!("b{}", encode_int(1001))).await);
    assert_eq!(
        expect_frame(&mut remote).await,
        ServerFrame::BoopRejected {
            boop_id: 1001,
            cooldown_ms: 59_950,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_burst_window_reopens_after_a_minute() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    for i in 1..=1000u64 {
        assert!(remote.send_text(format!("b{}", encode_int(i))).await);
        assert_eq!(expect_frame(&mut remote).await, ServerFrame::BoopAccepted(i));
        let _ = expect_frame(&mut remote).await;
    }

    advance_with_heartbeats(&mut remote, 60_000).await;
    assert!(remote.send_text(format!("b{}", encode_int(1001))).await);
    assert_eq!(
        expect_frame(&mut remote).await,
        ServerFrame::BoopAccepted(1001)
    );
}

// ========== Scenario: BPH saturation from the ledger ==========

#[tokio::test(start_paused = true)]
async fn test_preexisting_ledger_saturation_rejects_until_expiry() {
    let store = Arc::new(MemoryStore::new());
    let seeded_at = now_epoch_ms();
    store
        .push(&format!("bph/{CLIENT}"), json!([seeded_at + 1_800_000, 10_000]))
        .await
        .unwrap();

    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    assert!(remote.send_text("b1").await);
    let rejected = expect_frame(&mut remote).await;
    let ServerFrame::BoopRejected {
        boop_id: 1,
        cooldown_ms,
    } = rejected
    else {
        panic!("expected rejection, got {rejected:?}");
    };
    // The session's clock base is captured a hair after the seed stamp.
    assert!(
        (1_790_000..=1_800_000).contains(&cooldown_ms),
        "cooldown {cooldown_ms} not near the entry expiry"
    );

    // A cooldown query reports the identical remaining time.
    assert!(remote.send_text("d1").await);
    assert_eq!(
        expect_frame(&mut remote).await,
        ServerFrame::CooldownReply {
            query_id: 1,
            cooldown_ms,
        }
    );
}

// ========== Scenario: heartbeat loss ==========

#[tokio::test(start_paused = true)]
async fn test_heartbeat_starvation_closes_1001() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    tokio::time::advance(Duration::from_millis(30_000)).await;
    let (code, reason) = expect_close(&mut remote).await;
    assert_eq!(code, 1001);
    assert!(reason.contains("heartbeat"));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_just_in_time_rearms_the_watchdog() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    tokio::time::advance(Duration::from_millis(29_999)).await;
    assert!(remote.send_text("h").await);
    assert_eq!(expect_frame(&mut remote).await, ServerFrame::Heartbeat);

    // Alive well past the original deadline.
    tokio::time::advance(Duration::from_millis(29_999)).await;
    assert!(remote.send_text("d1").await);
    assert_eq!(expect_raw(&mut remote).await, "d1");

    // Starve the rearmed watchdog.
    tokio::time::advance(Duration::from_millis(30_000)).await;
    let (code, _) = expect_close(&mut remote).await;
    assert_eq!(code, 1001);
}

// ========== Scenario: cooldown abuse ==========

#[tokio::test(start_paused = true)]
async fn test_hammering_an_active_cooldown_closes_1002() {
    let store = Arc::new(MemoryStore::new());
    store
        .push(
            &format!("bph/{CLIENT}"),
            json!([now_epoch_ms() + 3_600_000, 10_000]),
        )
        .await
        .unwrap();

    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    // First boop starts the cooldown (does not count as a failure).
    assert!(remote.send_text("b1").await);
    assert!(matches!(
        expect_frame(&mut remote).await,
        ServerFrame::BoopRejected { boop_id: 1, .. }
    ));

    // Five rejects during the active cooldown, then the next boop closes.
    for i in 2..=6u64 {
        assert!(remote.send_text(format!("b{}", encode_int(i))).await);
        assert!(matches!(
            expect_frame(&mut remote).await,
            ServerFrame::BoopRejected { .. }
        ));
    }
    assert!(remote.send_text("b7").await);
    let (code, _) = expect_close(&mut remote).await;
    assert_eq!(code, 1002);
}

// ========== Scenario: shutdown flush ==========

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_unsynced_boops_in_one_batch() {
    let store = Arc::new(MemoryStore::new());
    let before = now_epoch_ms();
    let (mut remote, session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    for i in 1..=7u64 {
        assert!(remote.send_text(format!("b{}", encode_int(i))).await);
        assert_eq!(expect_frame(&mut remote).await, ServerFrame::BoopAccepted(i));
        assert_eq!(expect_frame(&mut remote).await, ServerFrame::Count(i));
    }

    // No sync interval has elapsed: nothing is in the store yet.
    assert_eq!(store.get("gbc").await.unwrap(), None);

    remote.disconnect();
    session.await.unwrap();

    // One atomic add of 7 and one ledger append of [now + 1h, 7].
    assert_eq!(store.get("gbc").await.unwrap(), Some(json!(7)));
    let subtree = store.get(&format!("bph/{CLIENT}")).await.unwrap().unwrap();
    let entries = subtree.as_object().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = entries.values().next().unwrap().as_array().unwrap();
    assert_eq!(entry[1], json!(7));
    let valid_until = entry[0].as_u64().unwrap();
    assert!(
        valid_until >= before + 3_600_000 && valid_until <= before + 3_610_000,
        "valid_until {valid_until} not about an hour out"
    );
}

// ========== Protocol robustness ==========

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_answers_i_and_continues() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    assert!(remote.send_text("boop!").await);
    assert_eq!(expect_raw(&mut remote).await, "i");

    assert!(remote.send_text("").await);
    assert_eq!(expect_raw(&mut remote).await, "i");

    assert!(remote.send_text("d1").await);
    assert_eq!(expect_raw(&mut remote).await, "d1");
}

#[tokio::test(start_paused = true)]
async fn test_binary_frames_are_ignored() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    assert!(remote.send_binary(vec![0xde, 0xad]).await);
    assert!(remote.send_text("d1").await);
    // The binary frame produced no reply; the query is answered next.
    assert_eq!(expect_raw(&mut remote).await, "d1");
}

// ========== Counter propagation ==========

#[tokio::test(start_paused = true)]
async fn test_external_counter_updates_are_pushed_to_the_client() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    store.atomic_add("gbc", 5).await.unwrap();
    assert_eq!(expect_frame(&mut remote).await, ServerFrame::Count(5));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_sync_lands_one_coalesced_add() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    for i in 1..=3u64 {
        assert!(remote.send_text(format!("b{}", encode_int(i))).await);
        let _ = expect_frame(&mut remote).await;
        let _ = expect_frame(&mut remote).await;
    }
    assert_eq!(store.get("gbc").await.unwrap(), None);

    tokio::time::advance(Duration::from_millis(250)).await;
    wait_for("the coalesced counter write", || {
        let store = Arc::clone(&store);
        Box::pin(async move { store.get("gbc").await.unwrap() == Some(json!(3)) })
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_counter_write_retries_next_interval() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    assert!(remote.send_text("b1").await);
    let _ = expect_frame(&mut remote).await;
    let _ = expect_frame(&mut remote).await;

    store.fail_next_writes(1);
    tokio::time::advance(Duration::from_millis(250)).await;
    // Let the failed attempt settle before the next interval opens.
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    assert_eq!(store.get("gbc").await.unwrap(), None);

    tokio::time::advance(Duration::from_millis(250)).await;
    wait_for("the retried counter write", || {
        let store = Arc::clone(&store);
        Box::pin(async move { store.get("gbc").await.unwrap() == Some(json!(1)) })
    })
    .await;
}

// ========== Ledger maintenance ==========

#[tokio::test(start_paused = true)]
async fn test_admissions_are_ledgered_every_minute() {
    let store = Arc::new(MemoryStore::new());
    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    for i in 1..=4u64 {
        assert!(remote.send_text(format!("b{}", encode_int(i))).await);
        let _ = expect_frame(&mut remote).await;
        let _ = expect_frame(&mut remote).await;
    }

    advance_with_heartbeats(&mut remote, 60_000).await;
    wait_for("the ledger append", || {
        let store = Arc::clone(&store);
        Box::pin(async move {
            let subtree = store.get(&format!("bph/{CLIENT}")).await.unwrap();
            subtree
                .and_then(|v| v.as_object().cloned())
                .map(|entries| {
                    entries
                        .values()
                        .filter_map(|v| v.as_array().map(|a| a[1].clone()))
                        .any(|change| change == json!(4))
                })
                .unwrap_or(false)
        })
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_ledger_entry_is_removed_and_admission_resumes() {
    let store = Arc::new(MemoryStore::new());
    store
        .push(
            &format!("bph/{CLIENT}"),
            json!([now_epoch_ms() + 100_000, 10_000]),
        )
        .await
        .unwrap();

    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    // Saturated: first boop rejected.
    assert!(remote.send_text("b1").await);
    assert!(matches!(
        expect_frame(&mut remote).await,
        ServerFrame::BoopRejected { boop_id: 1, .. }
    ));

    // Cross the entry's expiry; the session removes it from the store.
    advance_with_heartbeats(&mut remote, 140_000).await;
    wait_for("the expired entry removal", || {
        let store = Arc::clone(&store);
        Box::pin(async move {
            store
                .get(&format!("bph/{CLIENT}"))
                .await
                .unwrap()
                .and_then(|v| v.as_object().map(|m| m.is_empty()))
                .unwrap_or(false)
        })
    })
    .await;

    // Capacity is back.
    assert!(remote.send_text("b2").await);
    assert_eq!(expect_frame(&mut remote).await, ServerFrame::BoopAccepted(2));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_ledger_entry_is_scheduled_for_removal() {
    let store = Arc::new(MemoryStore::new());
    store
        .push(&format!("bph/{CLIENT}"), json!("garbage"))
        .await
        .unwrap();
    store
        .push(
            &format!("bph/{CLIENT}"),
            json!([now_epoch_ms() + 3_600_000, 2]),
        )
        .await
        .unwrap();

    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    wait_for("the malformed entry removal", || {
        let store = Arc::clone(&store);
        Box::pin(async move {
            store
                .get(&format!("bph/{CLIENT}"))
                .await
                .unwrap()
                .and_then(|v| v.as_object().map(|m| m.len() == 1))
                .unwrap_or(false)
        })
    })
    .await;

    // The valid entry still counts against the hourly window.
    assert!(remote.send_text("b1").await);
    assert_eq!(expect_frame(&mut remote).await, ServerFrame::BoopAccepted(1));
}

#[tokio::test(start_paused = true)]
async fn test_non_map_ledger_subtree_is_reset_on_init() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(&format!("bph/{CLIENT}"), json!("scribble"))
        .await
        .unwrap();

    let (mut remote, _session) = connect(&store).await;
    assert_eq!(expect_raw(&mut remote).await, "c0");

    assert_eq!(
        store.get(&format!("bph/{CLIENT}")).await.unwrap(),
        Some(json!({}))
    );
    assert!(remote.send_text("b1").await);
    assert_eq!(expect_frame(&mut remote).await, ServerFrame::BoopAccepted(1));
}
