//! Renewal of stored backend credentials.
//!
//! [`RefreshCoordinator::refresh`] enforces the attempt cap, counts the attempt
//! in the store before touching the network, and collapses concurrent refreshes
//! of the same provider within this process into a single renewal call.
//! Separate processes can still race on the same record; only the cap bounds that.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use super::{BackendClient, CredentialStore, Provider, RecordLookup, RefreshError, TokenPair};
use crate::config::RefreshConfig;

/// Outcome shared by every caller of one refresh.
pub type RefreshResult = Result<TokenPair, RefreshError>;

/// Caller-side retry loop around [`RefreshCoordinator::refresh`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    /// Delay before retry `n` is `base_delay * n`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl From<&RefreshConfig> for RetryPolicy {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

struct InFlightState {
    result: OnceCell<RefreshResult>,
    notify: Notify,
}

impl InFlightState {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn set_result(&self, result: RefreshResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> RefreshResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

/// Removes the in-flight entry when the leading refresh finishes or is dropped.
struct LeaderGuard<'a> {
    in_flight: &'a DashMap<Provider, Arc<InFlightState>>,
    provider: Provider,
    state: Arc<InFlightState>,
}

impl LeaderGuard<'_> {
    fn complete(self, result: RefreshResult) -> RefreshResult {
        self.state.set_result(result.clone());
        result
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.provider, |_, current| Arc::ptr_eq(current, &self.state));
        if self.state.result.get().is_none() {
            self.state.set_result(Err(RefreshError::Cancelled));
        }
    }
}

/// Sole writer of refresh bookkeeping on stored credentials.
pub struct RefreshCoordinator {
    store: CredentialStore,
    backend: BackendClient,
    max_attempts: u32,
    in_flight: DashMap<Provider, Arc<InFlightState>>,
}

impl RefreshCoordinator {
    pub fn new(store: CredentialStore, backend: BackendClient, max_attempts: u32) -> Self {
        Self {
            store,
            backend,
            max_attempts,
            in_flight: DashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a refresh for `provider` is currently running in this process.
    pub fn has_in_flight(&self, provider: Provider) -> bool {
        self.in_flight.contains_key(&provider)
    }

    /// Renew the credentials of `provider`, joining a refresh already in flight.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, provider: Provider) -> RefreshResult {
        // The map guard must be released before any await.
        let (state, leading) = match self.in_flight.entry(provider) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let state = Arc::new(InFlightState::new());
                entry.insert(Arc::clone(&state));
                (state, true)
            }
        };
        if !leading {
            debug!("joining in-flight refresh");
            return state.wait().await;
        }

        let guard = LeaderGuard {
            in_flight: &self.in_flight,
            provider,
            state,
        };
        let result = self.perform(provider).await;
        guard.complete(result)
    }

    /// [`refresh`](Self::refresh) with linear backoff, stopping early on terminal errors.
    pub async fn refresh_with_retry(
        &self,
        provider: Provider,
        policy: &RetryPolicy,
    ) -> RefreshResult {
        let mut attempt = 1;
        loop {
            match self.refresh(provider).await {
                Ok(tokens) => return Ok(tokens),
                Err(err) if err.is_terminal() || attempt >= policy.max_attempts => {
                    return Err(err)
                }
                Err(err) => {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        %provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "refresh failed, retrying after backoff",
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn perform(&self, provider: Provider) -> RefreshResult {
        let mut record = match self.store.load(provider).await {
            RecordLookup::Found(record) => record,
            RecordLookup::Missing => return Err(RefreshError::MissingRecord),
            RecordLookup::Unreadable(reason) => return Err(RefreshError::UnreadableRecord(reason)),
        };

        if record.attempts_exhausted(self.max_attempts) {
            warn!(
                attempts = record.refresh_attempts,
                max = self.max_attempts,
                "refresh refused, attempt cap reached"
            );
            return Err(RefreshError::AttemptsExhausted {
                attempts: record.refresh_attempts,
                max: self.max_attempts,
            });
        }

        let refresh_token = record
            .refresh
            .clone()
            .ok_or(RefreshError::MissingRefreshToken)?;

        record.begin_attempt(Utc::now());
        self.store
            .save(provider, &record)
            .await
            .map_err(|err| RefreshError::Store(err.to_string()))?;

        match self.backend.renew(provider, &refresh_token).await {
            Ok(tokens) => {
                let renewed = record.renewed(tokens, Utc::now());
                // The old refresh token may already be revoked; hand out the new pair regardless.
                match self.store.save(provider, &renewed).await {
                    Ok(()) => info!("credentials renewed"),
                    Err(err) => warn!(error = %err, "renewed credentials could not be stored"),
                }
                Ok(renewed.tokens())
            }
            Err(err) => {
                record.mark_failed();
                if let Err(store_err) = self.store.save(provider, &record).await {
                    warn!(error = %store_err, "could not persist failed refresh flag");
                }
                warn!(
                    attempts = record.refresh_attempts,
                    error = %err,
                    "credential renewal failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRecord, KvStore, MemoryKvStore};
    use crate::testutil::{config_for, FailingSetStore};
    use httpmock::prelude::*;

    fn coordinator(server: &MockServer) -> (RefreshCoordinator, CredentialStore) {
        coordinator_over(server, Arc::new(MemoryKvStore::new()))
    }

    fn coordinator_over(
        server: &MockServer,
        kv: Arc<dyn KvStore>,
    ) -> (RefreshCoordinator, CredentialStore) {
        let config = config_for(server);
        let store = CredentialStore::new(kv, Duration::from_secs(600));
        let backend = BackendClient::new(&config).unwrap();
        (
            RefreshCoordinator::new(store.clone(), backend, config.refresh.max_attempts),
            store,
        )
    }

    async fn seed(store: &CredentialStore, attempts: u32) {
        let mut record = AuthRecord::from_tokens(TokenPair::new("old-access", "refresh-1"));
        record.refresh_attempts = attempts;
        store.save(Provider::Primary, &record).await.unwrap();
    }

    #[tokio::test]
    async fn success_resets_bookkeeping() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "access": "new-access" }));
        });
        let (coordinator, store) = coordinator(&server);
        seed(&store, 2).await;

        let tokens = coordinator.refresh(Provider::Primary).await.unwrap();
        mock.assert();
        assert_eq!(tokens.access, "new-access");
        assert_eq!(tokens.refresh.as_deref(), Some("refresh-1"));

        let record = store.load(Provider::Primary).await.into_record().unwrap();
        assert_eq!(record.access, "new-access");
        assert_eq!(record.refresh_attempts, 0);
        assert!(!record.last_refresh_failed);
        assert!(record.last_refresh_time.is_some());
        assert!(!coordinator.has_in_flight(Provider::Primary));
    }

    #[tokio::test]
    async fn failure_counts_attempt_and_flags_record() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(500);
        });
        let (coordinator, store) = coordinator(&server);
        seed(&store, 0).await;

        let err = coordinator.refresh(Provider::Primary).await.unwrap_err();
        assert_eq!(err, RefreshError::Rejected { status: 500 });

        let record = store.load(Provider::Primary).await.into_record().unwrap();
        assert_eq!(record.refresh_attempts, 1);
        assert!(record.last_refresh_failed);
        assert_eq!(record.access, "old-access");
    }

    #[tokio::test]
    async fn fourth_call_after_three_failures_skips_network() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(503);
        });
        let (coordinator, store) = coordinator(&server);
        seed(&store, 0).await;

        for _ in 0..3 {
            assert!(coordinator.refresh(Provider::Primary).await.is_err());
        }
        mock.assert_hits(3);

        let err = coordinator.refresh(Provider::Primary).await.unwrap_err();
        assert_eq!(err, RefreshError::AttemptsExhausted { attempts: 3, max: 3 });
        assert!(err.is_terminal());
        mock.assert_hits(3);

        let record = store.load(Provider::Primary).await.into_record().unwrap();
        assert_eq!(record.refresh_attempts, 3);
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body_obj(&serde_json::json!({ "access": "shared", "refresh": "r-2" }));
        });
        let (coordinator, store) = coordinator(&server);
        seed(&store, 0).await;

        let (a, b, c, d) = tokio::join!(
            coordinator.refresh(Provider::Primary),
            coordinator.refresh(Provider::Primary),
            coordinator.refresh(Provider::Primary),
            coordinator.refresh(Provider::Primary),
        );

        mock.assert_hits(1);
        for result in [a, b, c, d] {
            assert_eq!(result.unwrap().access, "shared");
        }
    }

    #[tokio::test]
    async fn missing_record_is_terminal() {
        let server = MockServer::start();
        let (coordinator, _store) = coordinator(&server);
        let err = coordinator.refresh(Provider::Secondary).await.unwrap_err();
        assert_eq!(err, RefreshError::MissingRecord);
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn counter_is_persisted_before_renewal() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "access": "never" }));
        });
        // Write 1 seeds the record, write 2 is the attempt counter.
        let (coordinator, store) = coordinator_over(&server, Arc::new(FailingSetStore::new(2)));
        seed(&store, 0).await;

        let err = coordinator.refresh(Provider::Primary).await.unwrap_err();
        assert!(matches!(err, RefreshError::Store(_)));
        mock.assert_hits(0);

        let record = store.load(Provider::Primary).await.into_record().unwrap();
        assert_eq!(record.refresh_attempts, 0);
        assert_eq!(record.access, "old-access");
    }

    #[tokio::test]
    async fn renewed_pair_is_returned_when_store_write_fails() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "access": "new", "refresh": "rotated" }));
        });
        let (coordinator, store) = coordinator_over(&server, Arc::new(FailingSetStore::new(3)));
        seed(&store, 0).await;

        let tokens = coordinator.refresh(Provider::Primary).await.unwrap();
        mock.assert();
        assert_eq!(tokens, TokenPair::new("new", "rotated"));
        assert!(!coordinator.has_in_flight(Provider::Primary));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_terminal_without_network() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "access": "never" }));
        });
        let (coordinator, store) = coordinator(&server);
        let record = AuthRecord::from_tokens(TokenPair {
            access: "only-access".into(),
            refresh: None,
        });
        store.save(Provider::Primary, &record).await.unwrap();

        let err = coordinator.refresh(Provider::Primary).await.unwrap_err();
        assert_eq!(err, RefreshError::MissingRefreshToken);
        assert!(err.is_terminal());
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn dropped_leader_cancels_waiters() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(200)
                .delay(Duration::from_millis(1500))
                .json_body_obj(&serde_json::json!({ "access": "late" }));
        });
        let (coordinator, store) = coordinator(&server);
        let coordinator = Arc::new(coordinator);
        seed(&store, 0).await;

        let leader = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refresh(Provider::Primary).await }
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !coordinator.has_in_flight(Provider::Primary) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let waiter = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refresh(Provider::Primary).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(RefreshError::Cancelled));
        assert!(!coordinator.has_in_flight(Provider::Primary));
    }

    #[tokio::test]
    async fn retry_loop_gives_up_after_policy_attempts() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(502);
        });
        let (coordinator, store) = coordinator(&server);
        seed(&store, 0).await;

        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
        };
        let err = coordinator
            .refresh_with_retry(Provider::Primary, &policy)
            .await
            .unwrap_err();
        assert_eq!(err, RefreshError::Rejected { status: 502 });
        mock.assert_hits(2);

        let record = store.load(Provider::Primary).await.into_record().unwrap();
        assert_eq!(record.refresh_attempts, 2);
    }

    #[tokio::test]
    async fn retry_loop_stops_on_terminal_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/primary/refresh");
            then.status(500);
        });
        let (coordinator, store) = coordinator(&server);
        seed(&store, 2).await;

        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
        };
        let err = coordinator
            .refresh_with_retry(Provider::Primary, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::AttemptsExhausted { .. }));
        mock.assert_hits(1);
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(750));
    }
}
