//! boopd - real-time shared boop counter daemon.
//!
//! This is the binary entry point. See the `boopd` library for the core
//! functionality: per-connection sessions, rate limiting, store sync, and
//! the janitor sweep.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use boopd::auth::{
    Authenticator, HttpTokenMinter, StaticStoreOpener, StaticTokenMinter, StoreOpener,
    TokenMinter,
};
use boopd::store::MemoryStore;
use boopd::{janitor, server, Config};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "boopd", about = "Real-time shared boop counter daemon", version)]
struct Cli {
    /// Path to a config file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept client connections and serve the counter.
    Serve,
    /// Run one sweep of stale hourly-ledger entries and exit.
    ///
    /// Wire this to a cron-style scheduler with retries disabled.
    Janitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Serve => {
            let auth = build_authenticator(&config)?;
            server::serve(&config.listen_addr, auth).await
        }
        Command::Janitor => {
            let auth = build_authenticator(&config)?;
            janitor::run(&auth).await?;
            Ok(())
        }
    }
}

/// Assemble the `signin` capability from the configured collaborators.
fn build_authenticator(config: &Config) -> Result<Arc<Authenticator>> {
    let opener: Arc<dyn StoreOpener> = match config.store.engine.as_str() {
        "memory" => Arc::new(StaticStoreOpener::new(Arc::new(MemoryStore::new()))),
        other => bail!("unsupported store engine {other:?}; this build ships \"memory\""),
    };

    let minter: Arc<dyn TokenMinter> = if config.token_service_url.is_empty() {
        Arc::new(StaticTokenMinter)
    } else {
        Arc::new(HttpTokenMinter::new(config.token_service_url.clone())?)
    };

    Ok(Arc::new(Authenticator::new(
        minter,
        opener,
        config.token_prefix.clone(),
    )))
}
