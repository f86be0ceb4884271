//! Credential collaborator for the store.
//!
//! Sessions and the janitor consume exactly one capability:
//! `signin(uid) → store handle`. Behind it sits a token-mint RPC against
//! the configured token service and a TTL cache so every connection does
//! not cost a mint round-trip. Cache entries are keyed by
//! `(prefix, uid)` and re-minted when their remaining life dips below
//! [`TOKEN_MIN_REMAINING_MS`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;

use crate::constants::{TOKEN_MIN_REMAINING_MS, TOKEN_TTL_MS};
use crate::store::StoreHandle;

/// Error produced by credential operations.
#[derive(Debug)]
pub enum AuthError {
    /// The HTTP client could not be constructed.
    Setup(String),
    /// The token service refused or failed the mint.
    MintFailed(String),
    /// The store rejected the signin.
    SigninFailed(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "credential setup failed: {msg}"),
            Self::MintFailed(msg) => write!(f, "token mint failed: {msg}"),
            Self::SigninFailed(msg) => write!(f, "store signin failed: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Mints store tokens for a uid.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// Mint a fresh token for `uid`.
    async fn mint(&self, uid: &str) -> Result<String, AuthError>;
}

/// Opens a store session from a minted token.
#[async_trait]
pub trait StoreOpener: Send + Sync {
    /// Sign in to the store with `token`.
    async fn open(&self, token: &str) -> Result<StoreHandle, AuthError>;
}

/// Token minter backed by the external token service.
#[derive(Debug, Clone)]
pub struct HttpTokenMinter {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl HttpTokenMinter {
    /// Create a minter against the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TokenMinter for HttpTokenMinter {
    async fn mint(&self, uid: &str) -> Result<String, AuthError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "uid": uid }))
            .send()
            .await
            .map_err(|e| AuthError::MintFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::MintFailed(format!(
                "token service returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::MintFailed(e.to_string()))?;
        Ok(body.token)
    }
}

/// Minter for engines that do not check credentials (the in-process store).
#[derive(Debug, Default)]
pub struct StaticTokenMinter;

#[async_trait]
impl TokenMinter for StaticTokenMinter {
    async fn mint(&self, uid: &str) -> Result<String, AuthError> {
        Ok(format!("static-{uid}"))
    }
}

/// Opener that hands out the same in-process store handle for any token.
pub struct StaticStoreOpener {
    handle: StoreHandle,
}

impl StaticStoreOpener {
    /// Wrap an existing store handle.
    pub fn new(handle: StoreHandle) -> Self {
        Self { handle }
    }
}

impl fmt::Debug for StaticStoreOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticStoreOpener").finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreOpener for StaticStoreOpener {
    async fn open(&self, _token: &str) -> Result<StoreHandle, AuthError> {
        Ok(Arc::clone(&self.handle))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at_ms: u64,
}

/// The `signin(uid) → store session` capability with token caching.
pub struct Authenticator {
    minter: Arc<dyn TokenMinter>,
    opener: Arc<dyn StoreOpener>,
    prefix: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Build the capability from its collaborators. `prefix` namespaces the
    /// token cache.
    pub fn new(
        minter: Arc<dyn TokenMinter>,
        opener: Arc<dyn StoreOpener>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            minter,
            opener,
            prefix: prefix.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Mint (or reuse) a token for `uid` and open a store session with it.
    pub async fn signin(&self, uid: &str) -> Result<StoreHandle, AuthError> {
        let token = self.token_for(uid, epoch_ms()).await?;
        self.opener.open(&token).await
    }

    async fn token_for(&self, uid: &str, now_ms: u64) -> Result<String, AuthError> {
        let key = format!("{}:{}", self.prefix, uid);
        {
            let cache = self.cache.lock().expect("token cache lock poisoned");
            if let Some(cached) = cache.get(&key) {
                if cached.expires_at_ms.saturating_sub(now_ms) >= TOKEN_MIN_REMAINING_MS {
                    return Ok(cached.token.clone());
                }
            }
        }

        let token = self.minter.mint(uid).await?;
        let mut cache = self.cache.lock().expect("token cache lock poisoned");
        cache.insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at_ms: now_ms + TOKEN_TTL_MS,
            },
        );
        Ok(token)
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
