use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Provider;

const RECORD_VERSION: u32 = 1;

/// Opaque backend credentials as issued by a login or renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: Option<String>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: Some(refresh.into()),
        }
    }
}

/// Backend credentials persisted per provider namespace, with refresh bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub access: String,
    pub refresh: Option<String>,
    #[serde(default)]
    pub refresh_attempts: u32,
    #[serde(default)]
    pub last_refresh_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_refresh_failed: bool,
    #[serde(default = "default_created_at")]
    pub created_at: DateTime<Utc>,
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

impl AuthRecord {
    /// Fresh record as written after a login or a successful renewal.
    pub fn from_tokens(tokens: TokenPair) -> Self {
        Self {
            access: tokens.access,
            refresh: tokens.refresh,
            refresh_attempts: 0,
            last_refresh_time: None,
            last_refresh_failed: false,
            created_at: Utc::now(),
        }
    }

    pub fn tokens(&self) -> TokenPair {
        TokenPair {
            access: self.access.clone(),
            refresh: self.refresh.clone(),
        }
    }

    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.refresh_attempts >= max_attempts
    }

    /// Count an attempt that is about to hit the network.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.refresh_attempts = self.refresh_attempts.saturating_add(1);
        self.last_refresh_time = Some(now);
    }

    pub fn mark_failed(&mut self) {
        self.last_refresh_failed = true;
    }

    /// Record written after a verified renewal; the previous refresh token
    /// survives when the backend does not rotate it.
    pub fn renewed(&self, tokens: TokenPair, now: DateTime<Utc>) -> Self {
        Self {
            access: tokens.access,
            refresh: tokens.refresh.or_else(|| self.refresh.clone()),
            refresh_attempts: 0,
            last_refresh_time: Some(now),
            last_refresh_failed: false,
            created_at: self.created_at,
        }
    }
}

/// Outcome of reading a record from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLookup {
    Found(AuthRecord),
    Missing,
    /// The store failed, or the stored value could not be decoded.
    Unreadable(String),
}

impl RecordLookup {
    pub fn into_record(self) -> Option<AuthRecord> {
        match self {
            RecordLookup::Found(record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u32,
    provider: Provider,
    record: AuthRecord,
}

/// Unversioned camelCase record written by older deployments.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    access: String,
    refresh: Option<String>,
    #[serde(default)]
    refresh_attempts: u32,
    #[serde(default)]
    last_refresh_time: Option<LegacyTimestamp>,
    #[serde(default)]
    last_refresh_failed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyTimestamp {
    Millis(i64),
    Text(DateTime<Utc>),
}

impl LegacyTimestamp {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            LegacyTimestamp::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            LegacyTimestamp::Text(ts) => Some(ts),
        }
    }
}

impl From<LegacyRecord> for AuthRecord {
    fn from(legacy: LegacyRecord) -> Self {
        Self {
            access: legacy.access,
            refresh: legacy.refresh,
            refresh_attempts: legacy.refresh_attempts,
            last_refresh_time: legacy
                .last_refresh_time
                .and_then(LegacyTimestamp::into_datetime),
            last_refresh_failed: legacy.last_refresh_failed,
            created_at: Utc::now(),
        }
    }
}

/// Reasons a stored value is not a usable record.
#[derive(Debug, thiserror::Error)]
pub enum RecordDecodeError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u64),
    #[error("record belongs to provider '{found}', expected '{expected}'")]
    ProviderMismatch { expected: Provider, found: Provider },
}

pub(crate) fn encode_record(
    provider: Provider,
    record: &AuthRecord,
) -> Result<String, serde_json::Error> {
    let envelope = RecordEnvelope {
        version: RECORD_VERSION,
        provider,
        record: record.clone(),
    };
    serde_json::to_string(&envelope)
}

pub(crate) fn decode_record(
    provider: Provider,
    raw: &str,
) -> Result<AuthRecord, RecordDecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    match value.get("version").and_then(Value::as_u64) {
        Some(version) if version == u64::from(RECORD_VERSION) => {
            let envelope: RecordEnvelope = serde_json::from_value(value)?;
            if envelope.provider != provider {
                return Err(RecordDecodeError::ProviderMismatch {
                    expected: provider,
                    found: envelope.provider,
                });
            }
            Ok(envelope.record)
        }
        Some(version) => Err(RecordDecodeError::UnsupportedVersion(version)),
        None => {
            let legacy: LegacyRecord = serde_json::from_value(value)?;
            Ok(legacy.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn renewal_resets_bookkeeping_and_keeps_refresh() {
        let mut record = AuthRecord::from_tokens(TokenPair::new("old", "keep-me"));
        record.begin_attempt(Utc::now());
        record.mark_failed();
        let renewed = record.renewed(
            TokenPair {
                access: "new".into(),
                refresh: None,
            },
            Utc::now(),
        );
        assert_eq!(renewed.access, "new");
        assert_eq!(renewed.refresh.as_deref(), Some("keep-me"));
        assert_eq!(renewed.refresh_attempts, 0);
        assert!(!renewed.last_refresh_failed);
    }

    #[test]
    fn envelope_round_trip() {
        let mut record = AuthRecord::from_tokens(TokenPair::new("a", "r"));
        record.begin_attempt(Utc::now() - Duration::minutes(1));
        let raw = encode_record(Provider::Secondary, &record).unwrap();
        let decoded = decode_record(Provider::Secondary, &raw).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn legacy_record_is_upgraded() {
        let raw = r#"{"access":"a","refresh":"r","refreshAttempts":2,"lastRefreshTime":1700000000000,"lastRefreshFailed":true}"#;
        let record = decode_record(Provider::Primary, raw).unwrap();
        assert_eq!(record.refresh_attempts, 2);
        assert!(record.last_refresh_failed);
        assert_eq!(
            record.last_refresh_time.unwrap().timestamp_millis(),
            1_700_000_000_000
        );
    }

    #[test]
    fn future_versions_are_rejected() {
        let raw = r#"{"version":9,"provider":"primary","record":{}}"#;
        let err = decode_record(Provider::Primary, raw).unwrap_err();
        assert!(matches!(err, RecordDecodeError::UnsupportedVersion(9)));
    }

    #[test]
    fn provider_mismatch_is_rejected() {
        let record = AuthRecord::from_tokens(TokenPair::new("a", "r"));
        let raw = encode_record(Provider::Primary, &record).unwrap();
        let err = decode_record(Provider::Secondary, &raw).unwrap_err();
        assert!(matches!(err, RecordDecodeError::ProviderMismatch { .. }));
    }
}
