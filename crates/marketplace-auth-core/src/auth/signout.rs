use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{CredentialStore, OuterSession, Provider, ProviderSelector, StoreError};

const SIGNAL_CAPACITY: usize = 16;

/// Process-local, non-persistent key/value storage cleared on sign-out.
pub trait EphemeralStorage: Send + Sync {
    fn keys(&self) -> Vec<String>;
    fn remove(&self, key: &str);
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct MemoryEphemeralStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryEphemeralStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EphemeralStorage for MemoryEphemeralStorage {
    fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Broadcast to in-process caches holding derived auth state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationSignal {
    SignedOut,
    LoggedOut(Provider),
}

/// Which credential namespaces a remote purge removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    Provider(Provider),
    AllProviders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignoutStep {
    RemotePurge,
    OuterSession,
    LocalStorage,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: SignoutStep,
    pub succeeded: bool,
    pub detail: Option<String>,
}

/// What a sign-out managed to do; every step runs even if an earlier one failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignoutReport {
    pub steps: Vec<StepOutcome>,
    /// Location the caller should navigate to afterwards, if any.
    pub redirect: Option<String>,
}

impl SignoutReport {
    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|step| step.succeeded)
    }

    pub fn outcome(&self, step: SignoutStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|outcome| outcome.step == step)
    }

    fn record(&mut self, step: SignoutStep, result: Result<(), String>) {
        if let Err(detail) = &result {
            warn!(?step, %detail, "sign-out step failed, continuing");
        }
        self.steps.push(StepOutcome {
            step,
            succeeded: result.is_ok(),
            detail: result.err(),
        });
    }
}

/// Tears down credentials in a fixed order: remote store first, local state last.
pub struct SignoutOrchestrator {
    store: CredentialStore,
    selector: ProviderSelector,
    outer: Arc<dyn OuterSession>,
    local: Arc<dyn EphemeralStorage>,
    preserved_keys: Vec<String>,
    signals: broadcast::Sender<InvalidationSignal>,
}

impl SignoutOrchestrator {
    pub fn new(
        store: CredentialStore,
        selector: ProviderSelector,
        outer: Arc<dyn OuterSession>,
        local: Arc<dyn EphemeralStorage>,
        preserved_keys: Vec<String>,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            store,
            selector,
            outer,
            local,
            preserved_keys,
            signals,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationSignal> {
        self.signals.subscribe()
    }

    /// Delete stored credentials; every namespace in scope is attempted.
    pub async fn purge_remote(&self, scope: PurgeScope) -> Result<(), StoreError> {
        let providers: &[Provider] = match &scope {
            PurgeScope::Provider(provider) => std::slice::from_ref(provider),
            PurgeScope::AllProviders => &Provider::ALL,
        };

        let mut first_error = None;
        for provider in providers {
            if let Err(err) = self.store.delete(*provider).await {
                warn!(%provider, error = %err, "failed to purge stored credentials");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove every credential, end the outer session and wipe local state.
    pub async fn full_signout(&self, redirect_to: Option<&str>) -> SignoutReport {
        let mut report = SignoutReport::default();

        let purge = self.purge_remote(PurgeScope::AllProviders).await;
        report.record(SignoutStep::RemotePurge, purge.map_err(|e| e.to_string()));

        let outer = self.outer.invalidate().await;
        report.record(SignoutStep::OuterSession, outer.map_err(|e| e.to_string()));

        self.local.clear();
        report.record(SignoutStep::LocalStorage, Ok(()));

        self.broadcast(&mut report, InvalidationSignal::SignedOut);

        report.redirect = redirect_to.map(ToOwned::to_owned);
        info!(clean = report.all_succeeded(), "full sign-out finished");
        report
    }

    /// Drop the active provider's credentials only; the outer session and
    /// preserved local keys (locale, theme) survive.
    pub async fn partial_logout(&self) -> SignoutReport {
        let provider = self.selector.active_provider().await;
        let mut report = SignoutReport::default();

        let purge = self.purge_remote(PurgeScope::Provider(provider)).await;
        report.record(SignoutStep::RemotePurge, purge.map_err(|e| e.to_string()));

        for key in self.local.keys() {
            if !self.preserved_keys.iter().any(|kept| kept == &key) {
                self.local.remove(&key);
            }
        }
        report.record(SignoutStep::LocalStorage, Ok(()));

        self.broadcast(&mut report, InvalidationSignal::LoggedOut(provider));

        info!(%provider, clean = report.all_succeeded(), "partial logout finished");
        report
    }

    fn broadcast(&self, report: &mut SignoutReport, signal: InvalidationSignal) {
        // No subscribers is not a failure.
        let _ = self.signals.send(signal);
        report.record(SignoutStep::Broadcast, Ok(()));
    }
}
