//! API client for the pickup backend-as-a-service.
//!
//! `ApiClient` talks to the backend's auth service (`/auth/v1`) and to its
//! remote procedure endpoint (`/rest/v1/rpc`). Clones share the connection
//! pool and the access token slot, so a token set after sign-in is seen by
//! every clone, including the ones captured by identity lookups.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::SessionData;
use crate::models::User;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// Also bounds how long an identity lookup can hold its cache in flight.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Header carrying the project's public anon key on every request.
const API_KEY_HEADER: &str = "apikey";

/// Remote procedure answering whether the signed-in user was invited.
pub const IS_INVITED_USER_RPC: &str = "is_invited_user";

/// Remote procedure resolving the signed-in user's parent record id.
pub const CURRENT_PARENT_ID_RPC: &str = "get_current_parent_id";

/// Where the backend lives and the key that identifies the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    url: String,
    anon_key: String,
}

impl BackendSettings {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        Self {
            url,
            anon_key: anon_key.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    /// Seconds until the access token expires.
    expires_in: i64,
    user: User,
}

impl TokenResponse {
    fn into_session(self) -> SessionData {
        SessionData {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user_id: self.user.id,
            email: self.user.email,
            expires_at: Utc::now() + chrono::Duration::seconds(self.expires_in),
        }
    }
}

/// API client for the pickup backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    backend: Arc<BackendSettings>,
    token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(backend: BackendSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            backend: Arc::new(backend),
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn backend(&self) -> &BackendSettings {
        &self.backend
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&self, token: String) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub fn clear_token(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // =========================================================================
    // Auth
    // =========================================================================

    /// Sign in with email and password and return the new session
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SessionData> {
        let url = self.backend.endpoint("auth/v1/token?grant_type=password");
        let grant = PasswordGrant { email, password };

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.backend.anon_key())
            .json(&grant)
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send sign-in request")?;

        let response = Self::check_response(response).await?;
        let tokens: TokenResponse = response.json().await.context("Failed to parse sign-in response")?;
        debug!(user_id = %tokens.user.id, "Signed in");
        Ok(tokens.into_session())
    }

    /// Exchange a refresh token for a new session
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<SessionData> {
        let url = self.backend.endpoint("auth/v1/token?grant_type=refresh_token");

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.backend.anon_key())
            .json(&RefreshGrant { refresh_token })
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send token refresh request")?;

        let response = Self::check_response(response).await?;
        let tokens: TokenResponse = response.json().await.context("Failed to parse token refresh response")?;
        Ok(tokens.into_session())
    }

    /// Revoke the current session on the backend. A no-op without a token.
    pub async fn sign_out(&self) -> Result<()> {
        if self.token().is_none() {
            return Ok(());
        }
        let url = self.backend.endpoint("auth/v1/logout");
        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .map_err(ApiError::from)
            .context("Failed to send sign-out request")?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// Fetch the signed-in user. Without a token there is no user and no
    /// request is made.
    pub async fn current_user(&self) -> Result<Option<User>> {
        if self.token().is_none() {
            debug!("No access token, skipping user fetch");
            return Ok(None);
        }
        let url = self.backend.endpoint("auth/v1/user");
        let user: User = self.send_json(|| self.client.get(&url), &url).await?;
        Ok(Some(user))
    }

    // =========================================================================
    // Remote procedures
    // =========================================================================

    /// Call a named remote procedure with no arguments. Requires a session.
    pub async fn rpc<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        if self.token().is_none() {
            return Err(ApiError::NotAuthenticated.into());
        }
        let url = self.backend.endpoint(&format!("rest/v1/rpc/{}", name));
        self.send_json(|| self.client.post(&url).json(&serde_json::json!({})), &url)
            .await
            .with_context(|| format!("Remote procedure {} failed", name))
    }

    pub async fn is_invited_user(&self) -> Result<bool> {
        self.rpc(IS_INVITED_USER_RPC).await
    }

    pub async fn current_parent_id(&self) -> Result<Option<String>> {
        let id: Option<String> = self.rpc(CURRENT_PARENT_ID_RPC).await?;
        Ok(normalize_id(id))
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(API_KEY_HEADER, self.backend.anon_key());
        match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send an authorized request and parse its JSON body, backing off on 429.
    async fn send_json<T: DeserializeOwned>(
        &self,
        build: impl Fn() -> RequestBuilder,
        url: &str,
    ) -> Result<T> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .authorize(build())
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send request to {}", url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response
                        .json()
                        .await
                        .with_context(|| format!("Failed to parse JSON response from {}", url));
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }
}

/// Treat blank ids from the backend as absent.
fn normalize_id(id: Option<String>) -> Option<String> {
    id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
