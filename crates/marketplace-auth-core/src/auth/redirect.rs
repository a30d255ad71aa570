//! Loop-safe redirect decisions.
//!
//! Only [`RedirectEngine`] causes navigation. It refuses to redirect a page to
//! a redirect destination and fires at most once per cool-down window.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::{Clock, OuterSession, PurgeScope, SignoutOrchestrator};
use crate::config::RedirectConfig;

/// The two places an unauthenticated user can be sent.
///
/// Serialized as the symbolic contract values `"/login"` and `"/signin"`,
/// independent of [`RedirectConfig`]. The configured paths only shape the
/// location built by [`redirect_location`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RedirectTarget {
    /// Collect backend credentials; the outer session is still present.
    #[serde(rename = "/login")]
    Login,
    /// Start over from the outer sign-in.
    #[serde(rename = "/signin")]
    SignIn,
}

/// Why a redirect was requested; drives the user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectReason {
    SessionMissing,
    CredentialsMissing,
    CredentialsExpired,
    RefreshExhausted,
    BackendUnavailable,
}

impl RedirectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RedirectReason::SessionMissing => "session_missing",
            RedirectReason::CredentialsMissing => "credentials_missing",
            RedirectReason::CredentialsExpired => "credentials_expired",
            RedirectReason::RefreshExhausted => "refresh_exhausted",
            RedirectReason::BackendUnavailable => "backend_unavailable",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RedirectReason::SessionMissing => "Please sign in to continue.",
            RedirectReason::CredentialsMissing => "Please log in to access your account.",
            RedirectReason::CredentialsExpired => "Your session has expired. Please log in again.",
            RedirectReason::RefreshExhausted => {
                "We could not renew your session. Please log in again."
            }
            RedirectReason::BackendUnavailable => {
                "The service is temporarily unavailable. Please try again shortly."
            }
        }
    }
}

/// Performs the actual navigation for the host environment.
pub trait Navigator: Send + Sync {
    fn navigate(&self, location: &str);
}

/// Navigator for server-side hooks that only records the decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, location: &str) {
        info!(location, "redirect issued");
    }
}

/// Suppresses redirects fired within `window` of the previous one.
pub struct RedirectThrottle {
    clock: Arc<dyn Clock>,
    window: Duration,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl RedirectThrottle {
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            clock,
            window,
            last: Mutex::new(None),
        }
    }

    /// Claim the window: returns `false` if a redirect fired too recently,
    /// otherwise stamps the current time and returns `true`.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = *last {
            if now - previous < self.window {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    pub fn last_redirect(&self) -> Option<DateTime<Utc>> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    AlreadyAtDestination,
    Throttled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    Redirected {
        target: RedirectTarget,
        location: String,
    },
    Suppressed(SuppressReason),
}

/// Build the location for `target`, carrying `callback_path` back.
pub fn redirect_location(
    config: &RedirectConfig,
    target: RedirectTarget,
    callback_path: &str,
    reason: RedirectReason,
) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("callbackUrl", callback_path);
    let path = match target {
        RedirectTarget::Login => {
            query.append_pair("error", reason.code());
            query.append_pair("message", reason.message());
            &config.login_path
        }
        RedirectTarget::SignIn => &config.signin_path,
    };
    format!("{path}?{}", query.finish())
}

/// Whether `current_path` already is one of the redirect destinations.
pub fn is_destination(config: &RedirectConfig, current_path: &str) -> bool {
    let path = current_path
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    path == config.login_path.trim_end_matches('/')
        || path == config.signin_path.trim_end_matches('/')
}

pub struct RedirectEngine {
    config: RedirectConfig,
    throttle: RedirectThrottle,
    outer: Arc<dyn OuterSession>,
    cleanup: Arc<SignoutOrchestrator>,
    navigator: Arc<dyn Navigator>,
}

impl RedirectEngine {
    pub fn new(
        config: RedirectConfig,
        clock: Arc<dyn Clock>,
        outer: Arc<dyn OuterSession>,
        cleanup: Arc<SignoutOrchestrator>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let window = Duration::from_std(std::time::Duration::from_secs(config.cooldown_secs))
            .unwrap_or_else(|_| Duration::weeks(1));
        Self {
            throttle: RedirectThrottle::new(clock, window),
            config,
            outer,
            cleanup,
            navigator,
        }
    }

    pub fn throttle(&self) -> &RedirectThrottle {
        &self.throttle
    }

    /// Pick a destination for `current_path` and navigate there, unless that
    /// would loop.
    #[tracing::instrument(skip(self))]
    pub async fn decide_and_redirect(
        &self,
        current_path: &str,
        reason: RedirectReason,
    ) -> RedirectDecision {
        // Destination pages count against the window too.
        if !self.throttle.try_acquire() {
            debug!("redirect suppressed by cool-down");
            return RedirectDecision::Suppressed(SuppressReason::Throttled);
        }

        if is_destination(&self.config, current_path) {
            debug!("already on a redirect destination");
            return RedirectDecision::Suppressed(SuppressReason::AlreadyAtDestination);
        }

        let target = if self.outer.exists().await {
            RedirectTarget::Login
        } else {
            if let Err(err) = self.cleanup.purge_remote(PurgeScope::AllProviders).await {
                warn!(error = %err, "credential purge before sign-in failed");
            }
            RedirectTarget::SignIn
        };

        let location = redirect_location(&self.config, target, current_path, reason);
        self.navigator.navigate(&location);
        RedirectDecision::Redirected { target, location }
    }
}
