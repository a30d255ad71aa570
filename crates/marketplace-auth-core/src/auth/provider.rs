use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{KvStore, StoreError};

/// Store key holding the active provider namespace.
pub const PROVIDER_KEY: &str = "auth_provider";

/// Backend integrations sharing the credential store, each with its own namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    Primary,
    Secondary,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Primary, Provider::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Primary => "primary",
            Provider::Secondary => "secondary",
        }
    }

    /// Store key of this provider's [`AuthRecord`](super::AuthRecord).
    pub fn record_key(&self) -> &'static str {
        match self {
            Provider::Primary => "primary_auth",
            Provider::Secondary => "secondary_auth",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = InvalidProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Provider::Primary),
            "secondary" | "dummy" => Ok(Provider::Secondary),
            other => Err(InvalidProvider(other.to_owned())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error reported when parsing an unsupported provider name.
#[derive(Debug, thiserror::Error)]
#[error("invalid provider '{0}'")]
pub struct InvalidProvider(pub String);

/// Reads and writes the active provider namespace.
///
/// Callers resolve the provider once per operation and pass the resulting
/// [`Provider`] down, so concurrent requests never share hidden selector state.
#[derive(Clone)]
pub struct ProviderSelector {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ProviderSelector {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Active provider; missing, unknown or unreadable values fall back to primary.
    pub async fn active_provider(&self) -> Provider {
        match self.kv.get(PROVIDER_KEY).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|err: InvalidProvider| {
                warn!(error = %err, "ignoring unknown provider value");
                Provider::Primary
            }),
            Ok(None) => Provider::Primary,
            Err(err) => {
                debug!(error = %err, "provider lookup failed, using primary");
                Provider::Primary
            }
        }
    }

    pub async fn set_active_provider(&self, provider: Provider) -> Result<(), StoreError> {
        self.kv
            .set(PROVIDER_KEY, provider.as_str(), self.ttl)
            .await?;
        debug!(%provider, "active provider updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryKvStore;
    use crate::testutil::UnavailableStore;

    #[test]
    fn parse_provider_variants() {
        assert_eq!("primary".parse::<Provider>().unwrap(), Provider::Primary);
        assert_eq!("Secondary".parse::<Provider>().unwrap(), Provider::Secondary);
        assert_eq!("dummy".parse::<Provider>().unwrap(), Provider::Secondary);
    }

    #[test]
    fn invalid_provider() {
        let err = "tertiary".parse::<Provider>().unwrap_err();
        assert_eq!(err.0, "tertiary");
    }

    #[test]
    fn record_keys_are_namespaced() {
        assert_eq!(Provider::Primary.record_key(), "primary_auth");
        assert_eq!(Provider::Secondary.record_key(), "secondary_auth");
    }

    #[tokio::test]
    async fn missing_key_defaults_to_primary() {
        let selector = ProviderSelector::new(Arc::new(MemoryKvStore::new()), Duration::from_secs(60));
        assert_eq!(selector.active_provider().await, Provider::Primary);
    }

    #[tokio::test]
    async fn switch_is_persisted() {
        let kv = Arc::new(MemoryKvStore::new());
        let selector = ProviderSelector::new(kv.clone(), Duration::from_secs(60));
        selector
            .set_active_provider(Provider::Secondary)
            .await
            .unwrap();
        assert_eq!(selector.active_provider().await, Provider::Secondary);
        assert_eq!(
            kv.get(PROVIDER_KEY).await.unwrap().as_deref(),
            Some("secondary")
        );
    }

    #[tokio::test]
    async fn store_failure_defaults_to_primary() {
        let selector = ProviderSelector::new(Arc::new(UnavailableStore), Duration::from_secs(60));
        assert_eq!(selector.active_provider().await, Provider::Primary);
    }

    #[tokio::test]
    async fn garbage_value_defaults_to_primary() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(PROVIDER_KEY, "???", Duration::from_secs(60))
            .await
            .unwrap();
        let selector = ProviderSelector::new(kv, Duration::from_secs(60));
        assert_eq!(selector.active_provider().await, Provider::Primary);
    }
}
