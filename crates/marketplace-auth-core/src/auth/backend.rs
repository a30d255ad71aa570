use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthError, Provider, RefreshError, TokenPair};
use crate::config::{AuthConfig, BackendConfig};

const DEFAULT_USER_AGENT: &str = "marketplace-auth/0.1.0";

/// What the identity endpoint said about an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    /// The backend explicitly refused the token.
    Rejected,
    /// Timeout, transport failure or an unexpected status; says nothing about the token.
    Unreachable(String),
}

/// Talks to the owning backends' renewal and identity endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    primary: BackendConfig,
    secondary: BackendConfig,
    probe_timeout: Duration,
    refresh_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(DEFAULT_USER_AGENT).build()?;
        Ok(Self {
            http,
            primary: config.primary.clone(),
            secondary: config.secondary.clone(),
            probe_timeout: config.probe_timeout(),
            refresh_timeout: config.refresh.timeout(),
        })
    }

    pub fn endpoints(&self, provider: Provider) -> &BackendConfig {
        match provider {
            Provider::Primary => &self.primary,
            Provider::Secondary => &self.secondary,
        }
    }

    /// Ask the identity endpoint whether `access` is still accepted.
    pub async fn probe(&self, provider: Provider, access: &str) -> ProbeOutcome {
        let response = match self
            .http
            .get(self.endpoints(provider).identity_url.clone())
            .bearer_auth(access)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return ProbeOutcome::Unreachable("identity probe timed out".into())
            }
            Err(err) => return ProbeOutcome::Unreachable(err.to_string()),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return ProbeOutcome::Rejected;
        }
        if !status.is_success() {
            return ProbeOutcome::Unreachable(format!("identity endpoint returned {status}"));
        }

        match response.json::<IdentityResponse>().await {
            Ok(IdentityResponse {
                authenticated: true,
            }) => ProbeOutcome::Valid,
            Ok(IdentityResponse {
                authenticated: false,
            }) => ProbeOutcome::Rejected,
            Err(err) => ProbeOutcome::Unreachable(format!("unexpected identity payload: {err}")),
        }
    }

    /// Exchange a refresh credential for a new token pair.
    pub async fn renew(&self, provider: Provider, refresh: &str) -> Result<TokenPair, RefreshError> {
        let response = self
            .http
            .post(self.endpoints(provider).renew_url.clone())
            .json(&RenewRequest { refresh })
            .timeout(self.refresh_timeout)
            .send()
            .await
            .map_err(RefreshError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            debug!(%provider, %status, "renewal endpoint refused refresh");
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let payload: RenewResponse = response
            .json()
            .await
            .map_err(RefreshError::from_transport)?;
        Ok(TokenPair {
            access: payload.access,
            refresh: payload.refresh,
        })
    }
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    authenticated: bool,
}

#[derive(Debug, Serialize)]
struct RenewRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    access: String,
    refresh: Option<String>,
}
