use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use super::record::{decode_record, encode_record};
use super::{AuthRecord, Provider, RecordLookup, StoreError};

const USER_AGENT: &str = "marketplace-auth/0.1.0";

/// Shared key-value backend with per-key TTL.
///
/// Values are opaque strings; implementations never interpret them.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Client for the store service's HTTP protocol.
///
/// `GET ?key=` answers `{exists, value?}`; `POST {key, value, ttl}` and
/// `DELETE {key}` answer `{success}`.
#[derive(Debug, Clone)]
pub struct HttpKvStore {
    http: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpKvStore {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, StoreError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            endpoint,
            timeout,
        })
    }

    async fn expect_success(
        &self,
        key: &str,
        response: reqwest::Response,
    ) -> Result<(), StoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }
        let payload: WriteResponse = response.json().await?;
        if payload.success {
            Ok(())
        } else {
            Err(StoreError::Rejected(key.to_owned()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    exists: bool,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    key: &'a str,
    value: &'a str,
    ttl: u64,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    key: &'a str,
}

#[async_trait]
impl KvStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[("key", key)])
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }

        let payload: ReadResponse = response.json().await?;
        Ok(if payload.exists { payload.value } else { None })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&WriteRequest {
                key,
                value,
                ttl: ttl.as_secs(),
            })
            .timeout(self.timeout)
            .send()
            .await?;
        self.expect_success(key, response).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.endpoint.clone())
            .json(&DeleteRequest { key })
            .timeout(self.timeout)
            .send()
            .await?;
        self.expect_success(key, response).await
    }
}

/// In-process store honoring TTLs, for single-instance deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    /// Value and expiry; `None` never expires.
    entries: Arc<RwLock<HashMap<String, (String, Option<Instant>)>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| expires_at.map_or(true, |at| Instant::now() < at))
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let expires_at = Instant::now().checked_add(ttl);
        entries.insert(key.to_owned(), (value.to_owned(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Typed access to per-provider [`AuthRecord`]s.
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
    record_ttl: Duration,
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KvStore>, record_ttl: Duration) -> Self {
        Self { kv, record_ttl }
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    /// Read a record; store failures and undecodable values are reported as unreadable.
    pub async fn load(&self, provider: Provider) -> RecordLookup {
        let key = provider.record_key();
        match self.kv.get(key).await {
            Ok(Some(raw)) => match decode_record(provider, &raw) {
                Ok(record) => RecordLookup::Found(record),
                Err(err) => {
                    warn!(key, error = %err, "stored credentials are unreadable");
                    RecordLookup::Unreadable(err.to_string())
                }
            },
            Ok(None) => RecordLookup::Missing,
            Err(err) => {
                warn!(key, error = %err, "credential store read failed");
                RecordLookup::Unreadable(err.to_string())
            }
        }
    }

    pub async fn save(&self, provider: Provider, record: &AuthRecord) -> Result<(), StoreError> {
        let payload = encode_record(provider, record)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        self.kv
            .set(provider.record_key(), &payload, self.record_ttl)
            .await?;
        debug!(
            key = provider.record_key(),
            attempts = record.refresh_attempts,
            "credentials persisted"
        );
        Ok(())
    }

    pub async fn delete(&self, provider: Provider) -> Result<(), StoreError> {
        self.kv.delete(provider.record_key()).await
    }
}
