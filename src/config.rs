//! Configuration loading.
//!
//! Reads an optional JSON config file from the platform config directory
//! (or an explicit path), then applies `BOOPD_*` environment overrides.
//! Everything has a local-development default so `boopd serve` works out
//! of the box against the in-process store.

use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration blob handed to the store adapter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoreConfig {
    /// Store engine selector. This build ships `memory`.
    pub engine: String,
    /// Engine-specific endpoint/configuration string.
    pub base_url: String,
}

/// Daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Bind address for `serve`.
    pub listen_addr: String,
    /// Store adapter configuration.
    pub store: StoreConfig,
    /// Token-mint endpoint. Empty selects the static minter (for engines
    /// that do not check credentials).
    pub token_service_url: String,
    /// Namespace label for the token cache.
    pub token_cache_namespace: String,
    /// Cache key prefix for minted tokens.
    pub token_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2667".to_string(),
            store: StoreConfig {
                engine: "memory".to_string(),
                base_url: String::new(),
            },
            token_service_url: String::new(),
            token_cache_namespace: "boopd-tokens".to_string(),
            token_prefix: "fb".to_string(),
        }
    }
}

impl Config {
    /// The configuration directory: `BOOPD_CONFIG_DIR` if set, otherwise the
    /// platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = env::var("BOOPD_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("could not determine config directory")?
            .join("boopd"))
    }

    /// Load from the default location, falling back to defaults when no
    /// file exists, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        Self::load_from(&path)
    }

    /// Load from an explicit path (missing file means defaults), then apply
    /// environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config at {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("BOOPD_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(engine) = env::var("BOOPD_STORE_ENGINE") {
            self.store.engine = engine;
        }
        if let Ok(url) = env::var("BOOPD_STORE_URL") {
            self.store.base_url = url;
        }
        if let Ok(url) = env::var("BOOPD_TOKEN_SERVICE_URL") {
            self.token_service_url = url;
        }
        if let Ok(ns) = env::var("BOOPD_TOKEN_CACHE_NAMESPACE") {
            self.token_cache_namespace = ns;
        }
        if let Ok(prefix) = env::var("BOOPD_TOKEN_PREFIX") {
            self.token_prefix = prefix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_the_memory_engine() {
        let config = Config::default();
        assert_eq!(config.store.engine, "memory");
        assert!(config.token_service_url.is_empty());
        assert!(!config.listen_addr.is_empty());
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.store.engine, "memory");
    }

    #[test]
    fn test_load_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut written = Config::default();
        written.store.base_url = "https://store.example".to_string();
        written.token_prefix = "tp".to_string();
        fs::write(&path, serde_json::to_string_pretty(&written).unwrap()).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.store.base_url, "https://store.example");
        assert_eq!(loaded.token_prefix, "tp");
    }

    #[test]
    fn test_env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            serde_json::to_string(&Config::default()).unwrap(),
        )
        .unwrap();

        env::set_var("BOOPD_LISTEN_ADDR", "0.0.0.0:9999");
        let loaded = Config::load_from(&path).unwrap();
        env::remove_var("BOOPD_LISTEN_ADDR");

        assert_eq!(loaded.listen_addr, "0.0.0.0:9999");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
