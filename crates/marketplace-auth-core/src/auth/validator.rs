//! Two-level credential validation.
//!
//! The outer session is checked first, then the stored backend credentials,
//! then the identity probe, with a refresh when the probe rejects the token.
//! [`transition`] holds every decision and performs no I/O; [`SessionValidator`]
//! feeds it one event per state.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::{
    AuthRecord, BackendClient, CredentialStore, OuterSession, ProbeOutcome, Provider,
    ProviderSelector, RecordLookup, RedirectReason, RedirectTarget, RefreshCoordinator,
    RefreshResult, RetryPolicy,
};

/// Answer handed to pages, API handlers and background hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub needs_redirect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<RedirectTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub reason: Option<RedirectReason>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            needs_redirect: false,
            redirect_to: None,
            message: None,
            reason: None,
        }
    }

    pub fn redirect(target: RedirectTarget, reason: RedirectReason) -> Self {
        Self {
            is_valid: false,
            needs_redirect: true,
            redirect_to: Some(target),
            message: Some(reason.message().to_owned()),
            reason: Some(reason),
        }
    }

    /// Invalid without a redirect, used when validity cannot be established.
    pub fn unavailable(reason: RedirectReason) -> Self {
        Self {
            is_valid: false,
            needs_redirect: false,
            redirect_to: None,
            message: Some(reason.message().to_owned()),
            reason: Some(reason),
        }
    }
}

/// Where a validation run currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationState {
    CheckOuterSession,
    LoadCredential,
    Probe(AuthRecord),
    Refresh,
    Done(ValidationResult),
}

/// Result of the I/O performed for a state.
#[derive(Debug, Clone)]
pub enum ValidationEvent {
    OuterSession { present: bool },
    Credential(RecordLookup),
    Probe(ProbeOutcome),
    Refresh(RefreshResult),
}

/// How probe results without an explicit verdict are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePolicy {
    /// Timeouts and unexpected statuses count as valid.
    FailOpen,
    /// Timeouts and unexpected statuses count as invalid, without a redirect.
    FailClosed,
}

impl ProbePolicy {
    pub fn from_flag(fail_open: bool) -> Self {
        if fail_open {
            ProbePolicy::FailOpen
        } else {
            ProbePolicy::FailClosed
        }
    }
}

/// Advance the validation state machine by one event.
///
/// Events that do not belong to the current state leave it unchanged.
pub fn transition(
    state: ValidationState,
    event: ValidationEvent,
    policy: ProbePolicy,
) -> ValidationState {
    use ValidationEvent as E;
    use ValidationState as S;

    match (state, event) {
        (S::CheckOuterSession, E::OuterSession { present: false }) => S::Done(
            ValidationResult::redirect(RedirectTarget::SignIn, RedirectReason::SessionMissing),
        ),
        (S::CheckOuterSession, E::OuterSession { present: true }) => S::LoadCredential,
        (S::LoadCredential, E::Credential(RecordLookup::Found(record))) => S::Probe(record),
        (S::LoadCredential, E::Credential(_)) => S::Done(ValidationResult::redirect(
            RedirectTarget::Login,
            RedirectReason::CredentialsMissing,
        )),
        (S::Probe(_), E::Probe(ProbeOutcome::Valid)) => S::Done(ValidationResult::valid()),
        (S::Probe(_), E::Probe(ProbeOutcome::Rejected)) => S::Refresh,
        (S::Probe(_), E::Probe(ProbeOutcome::Unreachable(_))) => match policy {
            ProbePolicy::FailOpen => S::Done(ValidationResult::valid()),
            ProbePolicy::FailClosed => S::Done(ValidationResult::unavailable(
                RedirectReason::BackendUnavailable,
            )),
        },
        (S::Refresh, E::Refresh(Ok(_))) => S::Done(ValidationResult::valid()),
        (S::Refresh, E::Refresh(Err(err))) => {
            let reason = if err.is_terminal() {
                RedirectReason::RefreshExhausted
            } else {
                RedirectReason::CredentialsExpired
            };
            S::Done(ValidationResult::redirect(RedirectTarget::Login, reason))
        }
        (state, _) => state,
    }
}

/// Runs the two-level validation against live collaborators.
pub struct SessionValidator {
    outer: Arc<dyn OuterSession>,
    selector: ProviderSelector,
    store: CredentialStore,
    backend: BackendClient,
    refresher: Arc<RefreshCoordinator>,
    retry: RetryPolicy,
    policy: ProbePolicy,
}

impl SessionValidator {
    pub fn new(
        outer: Arc<dyn OuterSession>,
        selector: ProviderSelector,
        store: CredentialStore,
        backend: BackendClient,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            outer,
            selector,
            store,
            backend,
            refresher,
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: std::time::Duration::ZERO,
            },
            policy: ProbePolicy::FailOpen,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate against the currently active provider.
    pub async fn validate(&self) -> ValidationResult {
        let provider = self.selector.active_provider().await;
        self.validate_for(provider).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn validate_for(&self, provider: Provider) -> ValidationResult {
        let mut state = ValidationState::CheckOuterSession;
        loop {
            let event = match &state {
                ValidationState::CheckOuterSession => ValidationEvent::OuterSession {
                    present: self.outer.exists().await,
                },
                ValidationState::LoadCredential => {
                    ValidationEvent::Credential(self.store.load(provider).await)
                }
                ValidationState::Probe(record) => {
                    let outcome = self.backend.probe(provider, &record.access).await;
                    if let ProbeOutcome::Unreachable(detail) = &outcome {
                        warn!(
                            detail = %detail,
                            policy = ?self.policy,
                            "identity probe inconclusive"
                        );
                    }
                    ValidationEvent::Probe(outcome)
                }
                ValidationState::Refresh => ValidationEvent::Refresh(
                    self.refresher
                        .refresh_with_retry(provider, &self.retry)
                        .await,
                ),
                ValidationState::Done(result) => {
                    debug!(
                        is_valid = result.is_valid,
                        needs_redirect = result.needs_redirect,
                        "validation finished"
                    );
                    return result.clone();
                }
            };
            state = transition(state, event, self.policy);
        }
    }
}
