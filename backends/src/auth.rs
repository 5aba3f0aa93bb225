use crate::http::{check_status, transport_error};
use async_trait::async_trait;
use offsite_core::{Error, ErrorKind, ObfuscatedSecret, Result};
use serde::Deserialize;
use std::future::Future;
use tracing::{debug, warn};

/// Exchanges a long-lived refresh token for a short-lived access token.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<String>;
}

/// OAuth2 `refresh_token` grant against a token URL.
pub struct OAuthTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: ObfuscatedSecret,
}

impl OAuthTokenEndpoint {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: ObfuscatedSecret,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    async fn exchange(&self, refresh_token: &str) -> Result<String> {
        let client_secret = self.client_secret.reveal()?;
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await.map_err(|e| match e {
            Error::Http { status, message } if status == 400 || status == 403 => {
                Error::Unauthorized(format!("token endpoint returned {}: {}", status, message))
            }
            other => other,
        })?;

        let parsed: TokenResponse = response.json().await.map_err(transport_error)?;
        Ok(parsed.access_token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Unauthenticated,
    Authenticated { access_token: String },
}

/// Holds the refresh credential and the current access token of one backend.
pub struct AuthTokenManager {
    endpoint: Box<dyn TokenEndpoint>,
    refresh_token: ObfuscatedSecret,
    state: TokenState,
}

impl AuthTokenManager {
    pub fn new(endpoint: Box<dyn TokenEndpoint>, refresh_token: ObfuscatedSecret) -> Self {
        Self {
            endpoint,
            refresh_token,
            state: TokenState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &TokenState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(&self.state, TokenState::Authenticated { access_token } if !access_token.is_empty())
    }

    /// Fetches a fresh access token. A failed exchange leaves the previous state untouched.
    pub async fn refresh(&mut self) -> Result<String> {
        let refresh_token = self.refresh_token.reveal()?;
        let access_token = self.endpoint.exchange(&refresh_token).await?;
        if access_token.is_empty() {
            return Err(Error::Unauthorized("token endpoint returned an empty token".to_string()));
        }

        debug!("Obtained new access token");
        self.state = TokenState::Authenticated {
            access_token: access_token.clone(),
        };
        Ok(access_token)
    }

    pub async fn ensure_token(&mut self) -> Result<String> {
        match &self.state {
            TokenState::Authenticated { access_token } if !access_token.is_empty() => {
                Ok(access_token.clone())
            }
            _ => self.refresh().await,
        }
    }

    /// Runs `call` with the current token. On an authentication failure the token is
    /// refreshed and `call` runs once more; a second authentication failure is final.
    pub async fn authorized<T, F, Fut>(&mut self, mut call: F) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.ensure_token().await?;
        match call(token).await {
            Err(e) if e.kind() == ErrorKind::Authentication => {
                warn!(error = %e, "Access token rejected, refreshing");
                let token = self.refresh().await?;
                call(token).await.map_err(|e| match e.kind() {
                    ErrorKind::Authentication => {
                        Error::Unauthorized(format!("rejected after token refresh: {}", e))
                    }
                    _ => e,
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingEndpoint {
        exchanges: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn exchange(&self, refresh_token: &str) -> Result<String> {
            assert_eq!(refresh_token, "refresh-me");
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Unauthorized("invalid_grant".into()))
            } else {
                Ok(format!("token-{}", n))
            }
        }
    }

    fn manager(fail: bool) -> (AuthTokenManager, Arc<AtomicU32>) {
        let exchanges = Arc::new(AtomicU32::new(0));
        let endpoint = CountingEndpoint {
            exchanges: exchanges.clone(),
            fail,
        };
        let secret = ObfuscatedSecret::from_plain("refresh-me").unwrap();
        (AuthTokenManager::new(Box::new(endpoint), secret), exchanges)
    }

    #[tokio::test]
    async fn test_refresh_authenticates() {
        let (mut auth, exchanges) = manager(false);
        assert!(!auth.is_authenticated());

        assert_eq!(auth.ensure_token().await.unwrap(), "token-0");
        assert!(auth.is_authenticated());
        // cached
        assert_eq!(auth.ensure_token().await.unwrap(), "token-0");
        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_exchange_stays_unauthenticated() {
        let (mut auth, _) = manager(true);
        assert!(auth.refresh().await.is_err());
        assert_eq!(auth.state(), &TokenState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_authorized_retries_once_after_refresh() {
        let (mut auth, exchanges) = manager(false);
        let calls = Arc::new(AtomicU32::new(0));

        let result = auth
            .authorized(|token| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        assert_eq!(token, "token-0");
                        Err(Error::Unauthorized("expired_access_token".into()))
                    } else {
                        assert_eq!(token, "token-1");
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_terminal() {
        let (mut auth, exchanges) = manager(false);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = auth
            .authorized(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::http(401, "expired"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (mut auth, exchanges) = manager(false);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = auth
            .authorized(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::http(409, "path/conflict"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
    }
}
