use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::AuthError;

const USER_AGENT: &str = "marketplace-auth/0.1.0";

/// The first authentication level, known only by its presence.
#[async_trait]
pub trait OuterSession: Send + Sync {
    /// Whether the caller currently holds an outer session. Never cached.
    async fn exists(&self) -> bool;

    /// End the outer session.
    async fn invalidate(&self) -> Result<(), AuthError>;
}

/// Outer session exposed by the web tier's session and sign-out endpoints.
///
/// A session is present when the session endpoint answers with a JSON object
/// carrying a non-null `user`.
#[derive(Debug, Clone)]
pub struct HttpOuterSession {
    http: Client,
    session_url: Url,
    signout_url: Url,
    cookie: Option<String>,
    timeout: Duration,
}

impl HttpOuterSession {
    pub fn new(session_url: Url, signout_url: Url, timeout: Duration) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            session_url,
            signout_url,
            cookie: None,
            timeout,
        })
    }

    /// Forward the caller's session cookie on every request.
    pub fn with_cookie<S: Into<String>>(mut self, cookie: S) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.timeout);
        match &self.cookie {
            Some(cookie) => builder.header(COOKIE, cookie),
            None => builder,
        }
    }
}

#[async_trait]
impl OuterSession for HttpOuterSession {
    async fn exists(&self) -> bool {
        let response = match self
            .request(self.http.get(self.session_url.clone()))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "session endpoint refused lookup");
                return false;
            }
            Err(err) => {
                debug!(error = %err, "session lookup failed");
                return false;
            }
        };

        match response.json::<Value>().await {
            Ok(body) => body.get("user").is_some_and(|user| !user.is_null()),
            Err(_) => false,
        }
    }

    async fn invalidate(&self) -> Result<(), AuthError> {
        let response = self
            .request(self.http.post(self.signout_url.clone()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::SessionEndpoint { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn session(server: &MockServer) -> HttpOuterSession {
        HttpOuterSession::new(
            Url::parse(&format!("{}/api/auth/session", server.base_url())).unwrap(),
            Url::parse(&format!("{}/api/auth/signout", server.base_url())).unwrap(),
            Duration::from_secs(2),
        )
        .unwrap()
        .with_cookie("session-token=abc")
    }

    #[tokio::test]
    async fn session_with_user_exists() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/auth/session")
                .header("cookie", "session-token=abc");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "user": { "email": "a@b.c" } }));
        });

        assert!(session(&server).exists().await);
        mock.assert();
    }

    #[tokio::test]
    async fn empty_session_is_absent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/auth/session");
            then.status(200).json_body_obj(&serde_json::json!({}));
        });

        assert!(!session(&server).exists().await);
    }

    #[tokio::test]
    async fn unreachable_session_is_absent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/auth/session");
            then.status(500);
        });

        assert!(!session(&server).exists().await);
    }

    #[tokio::test]
    async fn invalidate_reports_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/auth/signout");
            then.status(403).body("csrf");
        });

        let err = session(&server).invalidate().await.unwrap_err();
        assert!(matches!(err, AuthError::SessionEndpoint { .. }));
    }
}
