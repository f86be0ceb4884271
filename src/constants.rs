//! Application-wide constants for boopd.
//!
//! This module centralizes all magic numbers and configuration constants
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Rate limits**: admission windows and caps
//! - **Sync cadence**: store reconciliation intervals
//! - **Connection**: heartbeat and close codes
//! - **Store layout**: persisted paths
//! - **Credentials**: token cache lifetimes

// ============================================================================
// Rate limits
// ============================================================================

/// Maximum boops admitted per short (burst) window.
pub const BPM_LIMIT: usize = 1000;

/// Length of the short admission window in milliseconds.
pub const BPM_WINDOW_MS: u64 = 60_000;

/// Maximum boops admitted per long (hourly) window.
///
/// The hourly window is ledgered in the store, so it survives disconnects
/// and spans reconnects from the same client.
pub const BPH_LIMIT: u64 = 10_000;

/// Length of the long admission window in milliseconds.
pub const BPH_WINDOW_MS: u64 = 3_600_000;

/// Consecutive rejected boops during an active cooldown before the
/// connection is closed as abusive.
pub const CD_FAIL_LIMIT: u32 = 5;

// ============================================================================
// Sync cadence
// ============================================================================

/// Minimum interval between atomic-add writes of coalesced increments
/// against the shared counter.
///
/// At anything faster the store cannot service bursts client-by-client;
/// coalescing bounds write RPS per session while the optimistic display
/// keeps the count approximately live.
pub const GBC_SYNC_INTERVAL_MS: u64 = 250;

/// Interval between appends of unsynced admissions to the client's hourly
/// ledger in the store.
pub const BPH_SYNC_INTERVAL_MS: u64 = 60_000;

/// Upper bound on the shutdown flush. If the final counter write and ledger
/// append have not completed within this window, local state is abandoned;
/// the janitor and the next connection reconcile.
pub const SHUTDOWN_FLUSH_TIMEOUT_MS: u64 = 10_000;

/// Extra grace the janitor allows past an entry's expiry before sweeping it,
/// so it never races an owning session that is still flushing.
pub const JANITOR_GRACE_MS: u64 = 3_600_000;

// ============================================================================
// Connection
// ============================================================================

/// Close the session if no inbound heartbeat arrives within this window.
/// Clients are expected to send heartbeats roughly 5 seconds before expiry.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Close code for initialization failures.
pub const CLOSE_INTERNAL_ERROR: u16 = 1000;

/// Close code for heartbeat starvation. Clients reconnect on this.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 1001;

/// Close code for protocol abuse (boops hammered during an active cooldown).
/// Clients must NOT reconnect on this.
pub const CLOSE_COOLDOWN_ABUSE: u16 = 1002;

/// Reason string sent with [`CLOSE_INTERNAL_ERROR`].
pub const REASON_INTERNAL_ERROR: &str = "Internal Server Error";

/// Reason string sent with [`CLOSE_HEARTBEAT_TIMEOUT`].
pub const REASON_HEARTBEAT_TIMEOUT: &str =
    "No heartbeat received within the timeout period";

/// Reason string sent with [`CLOSE_COOLDOWN_ABUSE`].
pub const REASON_COOLDOWN_ABUSE: &str = "Too many boops during an active cooldown";

// ============================================================================
// Wire format
// ============================================================================

/// Maximum width of a base-36 integer on the wire. Eleven digits cover the
/// full 53-bit safe-integer range.
pub const MAX_WIRE_INT_DIGITS: usize = 11;

// ============================================================================
// Store layout
// ============================================================================

/// Path of the shared global counter. Mutated only via atomic add.
pub const GBC_PATH: &str = "gbc";

/// Root of the per-client hourly ledger subtrees.
pub const BPH_ROOT: &str = "bph";

/// Uid the server mints store tokens for. All sessions and the janitor
/// authenticate as this principal; per-client isolation lives in the
/// key layout, not in store auth.
pub const STORE_SESSION_UID: &str = "server";

// ============================================================================
// Credentials
// ============================================================================

/// Lifetime of a minted store token.
pub const TOKEN_TTL_MS: u64 = 3_600_000;

/// Re-mint when a cached token has less remaining life than this.
pub const TOKEN_MIN_REMAINING_MS: u64 = 10_000;
