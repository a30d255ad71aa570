use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use super::{
    AuthError, AuthRecord, BackendClient, Clock, CredentialStore, EphemeralStorage, HttpKvStore,
    InvalidationSignal, KvStore, LogNavigator, MemoryEphemeralStorage, Navigator, OuterSession,
    ProbePolicy, Provider, ProviderSelector, RecordLookup, RedirectDecision, RedirectEngine,
    RedirectReason, RefreshCoordinator, RefreshResult, RetryPolicy, SessionValidator,
    SignoutOrchestrator, SignoutReport, SystemClock, TokenPair, ValidationResult,
};
use crate::config::AuthConfig;

/// External capabilities the engine is wired to.
pub struct Collaborators {
    pub kv: Arc<dyn KvStore>,
    pub outer: Arc<dyn OuterSession>,
    pub local: Arc<dyn EphemeralStorage>,
    pub navigator: Arc<dyn Navigator>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(kv: Arc<dyn KvStore>, outer: Arc<dyn OuterSession>) -> Self {
        Self {
            kv,
            outer,
            local: Arc::new(MemoryEphemeralStorage::new()),
            navigator: Arc::new(LogNavigator),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use the HTTP store service named in `config`.
    pub fn http(config: &AuthConfig, outer: Arc<dyn OuterSession>) -> Result<Self, AuthError> {
        let kv = HttpKvStore::new(config.store.url.clone(), config.store.timeout())?;
        Ok(Self::new(Arc::new(kv), outer))
    }

    pub fn with_local_storage(mut self, local: Arc<dyn EphemeralStorage>) -> Self {
        self.local = local;
        self
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Coordinates login, validation, refresh, redirects and sign-out.
pub struct AuthManager {
    store: CredentialStore,
    selector: ProviderSelector,
    refresher: Arc<RefreshCoordinator>,
    validator: SessionValidator,
    signout: Arc<SignoutOrchestrator>,
    redirect: RedirectEngine,
}

impl AuthManager {
    pub fn new(config: &AuthConfig, collaborators: Collaborators) -> Result<Self, AuthError> {
        let Collaborators {
            kv,
            outer,
            local,
            navigator,
            clock,
        } = collaborators;

        let store = CredentialStore::new(
            Arc::clone(&kv),
            Duration::from_secs(config.store.record_ttl_secs),
        );
        let selector = ProviderSelector::new(kv, Duration::from_secs(config.store.provider_ttl_secs));
        let backend = BackendClient::new(config)?;
        let refresher = Arc::new(RefreshCoordinator::new(
            store.clone(),
            backend.clone(),
            config.refresh.max_attempts,
        ));
        let validator = SessionValidator::new(
            Arc::clone(&outer),
            selector.clone(),
            store.clone(),
            backend,
            Arc::clone(&refresher),
        )
        .with_retry(RetryPolicy::from(&config.refresh))
        .with_probe_policy(ProbePolicy::from_flag(config.probe_fail_open));
        let signout = Arc::new(SignoutOrchestrator::new(
            store.clone(),
            selector.clone(),
            Arc::clone(&outer),
            local,
            config.preserved_local_keys.clone(),
        ));
        let redirect = RedirectEngine::new(
            config.redirect.clone(),
            clock,
            outer,
            Arc::clone(&signout),
            navigator,
        );

        Ok(Self {
            store,
            selector,
            refresher,
            validator,
            signout,
            redirect,
        })
    }

    /// Store credentials from a fresh login and make `provider` active.
    ///
    /// Replaces any previous record, which also lifts an exhausted refresh cap.
    pub async fn login(&self, provider: Provider, tokens: TokenPair) -> Result<(), AuthError> {
        self.store
            .save(provider, &AuthRecord::from_tokens(tokens))
            .await?;
        self.selector.set_active_provider(provider).await?;
        info!(%provider, "backend credentials stored");
        Ok(())
    }

    pub async fn active_provider(&self) -> Provider {
        self.selector.active_provider().await
    }

    pub async fn switch_provider(&self, provider: Provider) -> Result<(), AuthError> {
        self.selector.set_active_provider(provider).await?;
        Ok(())
    }

    pub async fn current_record(&self) -> RecordLookup {
        let provider = self.selector.active_provider().await;
        self.store.load(provider).await
    }

    pub async fn validate(&self) -> ValidationResult {
        self.validator.validate().await
    }

    /// Validate and, when the result calls for it, redirect away from `current_path`.
    pub async fn guard(&self, current_path: &str) -> (ValidationResult, Option<RedirectDecision>) {
        let result = self.validate().await;
        if !result.needs_redirect {
            return (result, None);
        }
        let reason = result.reason.unwrap_or(RedirectReason::CredentialsMissing);
        let decision = self.redirect.decide_and_redirect(current_path, reason).await;
        (result, Some(decision))
    }

    /// A single refresh attempt for the active provider.
    pub async fn refresh(&self) -> RefreshResult {
        let provider = self.selector.active_provider().await;
        self.refresher.refresh(provider).await
    }

    pub async fn full_signout(&self, redirect_to: Option<&str>) -> SignoutReport {
        self.signout.full_signout(redirect_to).await
    }

    pub async fn partial_logout(&self) -> SignoutReport {
        self.signout.partial_logout().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationSignal> {
        self.signout.subscribe()
    }
}
