use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::Provider;

const CONFIG_FILE_NAME: &str = "auth.json";
const ENV_PREFIX: &str = "MARKETPLACE_AUTH_";

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "marketplace", "marketplace-auth")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    /// Use an explicit directory instead of the per-user default.
    pub fn from_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path to the JSON configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur while locating or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for marketplace-auth")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// Top-level settings for the authentication engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub store: StoreConfig,
    pub primary: BackendConfig,
    pub secondary: BackendConfig,
    pub refresh: RefreshConfig,
    pub redirect: RedirectConfig,
    /// Treat identity probe timeouts and 5xx responses as "still valid".
    ///
    /// A sustained backend outage keeps stale credentials usable while this is on.
    pub probe_fail_open: bool,
    pub probe_timeout_secs: u64,
    /// Local storage keys that survive a partial logout.
    pub preserved_local_keys: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            primary: BackendConfig::new("http://localhost:8000/api/auth"),
            secondary: BackendConfig::new("http://localhost:8001/api/auth"),
            refresh: RefreshConfig::default(),
            redirect: RedirectConfig::default(),
            probe_fail_open: true,
            probe_timeout_secs: 5,
            preserved_local_keys: vec!["locale".into(), "theme".into()],
        }
    }
}

impl AuthConfig {
    /// Load defaults, then `auth.json` from the locator directory, then environment overrides.
    pub fn load(locator: &ConfigLocator) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&locator.config_file())?.unwrap_or_default();
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Read a configuration file, returning `None` when it does not exist.
    pub fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }

    /// Apply `MARKETPLACE_AUTH_*` overrides using the supplied lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(value) = var("STORE_URL") {
            self.store.url = Url::parse(&value)?;
        }
        if let Some(value) = var("PRIMARY_URL") {
            self.primary = BackendConfig::from_base(Url::parse(&value)?)?;
        }
        if let Some(value) = var("SECONDARY_URL") {
            self.secondary = BackendConfig::from_base(Url::parse(&value)?)?;
        }
        if let Some(value) = var("MAX_REFRESH_ATTEMPTS") {
            self.refresh.max_attempts = parse_env("MAX_REFRESH_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("PROBE_FAIL_OPEN") {
            self.probe_fail_open = parse_env("PROBE_FAIL_OPEN", &value)?;
        }
        if let Some(value) = var("REDIRECT_COOLDOWN_SECS") {
            self.redirect.cooldown_secs = parse_env("REDIRECT_COOLDOWN_SECS", &value)?;
        }
        Ok(())
    }

    pub fn backend(&self, provider: Provider) -> &BackendConfig {
        match provider {
            Provider::Primary => &self.primary,
            Provider::Secondary => &self.secondary,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: format!("{ENV_PREFIX}{name}"),
        value: value.to_owned(),
    })
}

/// Location and limits of the shared key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: Url,
    pub timeout_secs: u64,
    /// TTL applied to persisted credential records.
    pub record_ttl_secs: u64,
    /// TTL applied to the active-provider key.
    pub provider_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://localhost:3000/api/store").expect("static URL"),
            timeout_secs: 5,
            record_ttl_secs: 30 * 24 * 60 * 60,
            provider_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Endpoints exposed by one owning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub renew_url: Url,
    pub identity_url: Url,
}

impl BackendConfig {
    fn new(base: &str) -> Self {
        Self::from_base(Url::parse(base).expect("static URL")).expect("static URL")
    }

    /// Derive `<base>/refresh` and `<base>/me` from a backend base URL.
    pub fn from_base(base: Url) -> Result<Self, ConfigError> {
        let mut base = base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            renew_url: base.join("refresh")?,
            identity_url: base.join("me")?,
        })
    }
}

/// Limits for the refresh coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    /// Tries per validation, including the first.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 15,
            retry_attempts: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl RefreshConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Redirect destinations and the loop-breaking window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub login_path: String,
    pub signin_path: String,
    pub cooldown_secs: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".into(),
            signin_path: "/signin".into(),
            cooldown_secs: 10,
        }
    }
}
