// Library modules
pub mod auth;
pub mod channel;
pub mod client_id;
pub mod config;
pub mod constants;
pub mod counter;
pub mod janitor;
pub mod ledger;
pub mod limiter;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use auth::{Authenticator, HttpTokenMinter, StaticStoreOpener, StaticTokenMinter};
pub use channel::{ChannelEvent, ChannelOutput, ChannelRemote, SessionChannel};
pub use client_id::ClientId;
pub use config::Config;
pub use counter::CounterSync;
pub use janitor::SweepStats;
pub use ledger::{BphEntry, BphLedger};
pub use limiter::RateLimiter;
pub use protocol::{ClientFrame, ServerFrame};
pub use session::Session;
pub use store::{MemoryStore, Store, StoreHandle};
