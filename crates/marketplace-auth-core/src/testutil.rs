//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use httpmock::MockServer;
use url::Url;

use crate::auth::{AuthError, KvStore, MemoryKvStore, Navigator, OuterSession, StoreError};
use crate::config::{AuthConfig, BackendConfig};

/// Configuration pointing every endpoint at `server`.
pub fn config_for(server: &MockServer) -> AuthConfig {
    let base = |path: &str| Url::parse(&server.url(path)).unwrap();
    let mut config = AuthConfig::default();
    config.store.url = base("/api/store");
    config.primary = BackendConfig::from_base(base("/primary")).unwrap();
    config.secondary = BackendConfig::from_base(base("/secondary")).unwrap();
    config.probe_timeout_secs = 1;
    config.refresh.max_attempts = 3;
    config.refresh.timeout_secs = 2;
    config.refresh.retry_base_delay_ms = 10;
    config
}

/// A store whose every operation fails.
pub struct UnavailableStore;

#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store offline".into()))
    }
}

/// In-memory store whose `fail_on`-th `set` (1-based) fails.
pub struct FailingSetStore {
    inner: MemoryKvStore,
    sets: AtomicUsize,
    fail_on: usize,
}

impl FailingSetStore {
    pub fn new(fail_on: usize) -> Self {
        Self {
            inner: MemoryKvStore::new(),
            sets: AtomicUsize::new(0),
            fail_on,
        }
    }
}

#[async_trait]
impl KvStore for FailingSetStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        if self.sets.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StoreError::Unavailable("write failed".into()));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Outer session whose presence is fixed until invalidated.
pub struct StaticSession {
    present: AtomicBool,
}

impl StaticSession {
    pub fn new(present: bool) -> Self {
        Self {
            present: AtomicBool::new(present),
        }
    }
}

#[async_trait]
impl OuterSession for StaticSession {
    async fn exists(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    async fn invalidate(&self) -> Result<(), AuthError> {
        self.present.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    locations: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn locations(&self) -> Vec<String> {
        self.locations.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, location: &str) {
        self.locations.lock().unwrap().push(location.to_owned());
    }
}
