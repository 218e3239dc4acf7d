//! Token lifecycle management.
//!
//! The token store owns the persisted access/refresh token pair and the
//! authenticated user id; consumers ask it for a fresh value each time
//! rather than holding copies. The token manager layers a refresh-margin
//! check and a single-flight refresh on top: concurrent callers observed
//! while a refresh is in flight all await the one in-progress exchange,
//! so at most one refresh request is ever on the wire and exactly one
//! persisted-token write happens per refresh cycle.

use crate::config::HarborConfig;
use crate::errors::{AuthError, HarborError, HarborResult, SecureStoreError};
use crate::transport::{HttpRequest, HttpTransport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use url::Url;

/// Secure-store key under which the token record is persisted.
const TOKEN_RECORD_KEY: &str = "harbor.auth.tokens";

/// Refresh-token exchange endpoint.
const REFRESH_PATH: &str = "auth/refresh";

/// Encrypted key-value store collaborator (platform keychain/keystore).
///
/// Implementations are provided by the host application; the network
/// layer only requires get/put/delete of opaque string values.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<String>, SecureStoreError>;

    /// Writes a value, replacing any previous one atomically.
    async fn put(&self, key: &str, value: &str) -> Result<(), SecureStoreError>;

    /// Deletes a value.
    async fn delete(&self, key: &str) -> Result<(), SecureStoreError>;
}

/// Persisted token record. Serialized as a single secure-store value so
/// an overwrite is atomic: no reader ever observes a partial write.
#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    user_id: String,
}

/// In-memory view of the stored credentials.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    /// Bearer access token.
    pub access_token: SecretString,
    /// Refresh token.
    pub refresh_token: SecretString,
    /// Access token expiration.
    pub expires_at: DateTime<Utc>,
    /// Authenticated user id.
    pub user_id: String,
}

impl AuthTokens {
    /// Creates tokens from plain strings.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: SecretString::new(refresh_token.into()),
            expires_at,
            user_id: user_id.into(),
        }
    }
}

/// Access token handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// The token value.
    pub token: SecretString,
    /// Expiration time.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Returns true if the token expires within `margin` from now.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        let margin = ChronoDuration::from_std(margin).unwrap_or_else(|_| ChronoDuration::zero());
        Utc::now() >= self.expires_at - margin
    }

    /// Returns the `Authorization` header value.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

/// Durable token storage backed by the platform secure store.
pub struct TokenStore {
    store: Arc<dyn SecureStore>,
    cached: RwLock<Option<AuthTokens>>,
}

impl TokenStore {
    /// Creates a token store over the given secure store.
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    /// Loads persisted credentials into memory. Called once at startup.
    pub async fn load(&self) -> Result<(), AuthError> {
        let raw = self.store.get(TOKEN_RECORD_KEY).await?;
        let tokens = match raw {
            Some(json) => {
                let record: TokenRecord = serde_json::from_str(&json)
                    .map_err(|e| AuthError::Storage(format!("Corrupt token record: {}", e)))?;
                Some(AuthTokens::new(
                    record.access_token,
                    record.refresh_token,
                    record.expires_at,
                    record.user_id,
                ))
            }
            None => None,
        };
        *self.cached.write().await = tokens;
        Ok(())
    }

    /// Persists new credentials, overwriting the previous record.
    pub async fn save(&self, tokens: AuthTokens) -> Result<(), AuthError> {
        let record = TokenRecord {
            access_token: tokens.access_token.expose_secret().clone(),
            refresh_token: tokens.refresh_token.expose_secret().clone(),
            expires_at: tokens.expires_at,
            user_id: tokens.user_id.clone(),
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| AuthError::Storage(format!("Encoding token record: {}", e)))?;
        self.store.put(TOKEN_RECORD_KEY, &json).await?;
        *self.cached.write().await = Some(tokens);
        Ok(())
    }

    /// Removes all stored credentials.
    pub async fn clear(&self) -> Result<(), AuthError> {
        self.store.delete(TOKEN_RECORD_KEY).await?;
        *self.cached.write().await = None;
        Ok(())
    }

    /// Returns the current credentials, if any.
    pub async fn current(&self) -> Option<AuthTokens> {
        self.cached.read().await.clone()
    }

    /// Returns the authenticated user id, if credentials are stored.
    pub async fn user_id(&self) -> Option<String> {
        self.cached.read().await.as_ref().map(|t| t.user_id.clone())
    }

    /// Returns true if credentials are stored.
    pub async fn has_credentials(&self) -> bool {
        self.cached.read().await.is_some()
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken, AuthError>>>;

/// Refresh-margin-aware token provider with single-flight refresh.
pub struct TokenManager {
    store: Arc<TokenStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_url: Url,
    refresh_margin: Duration,
    timeout: Duration,
    in_flight: Mutex<Option<RefreshFuture>>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    /// Present when the server rotates refresh tokens.
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenManager {
    /// Creates a token manager.
    pub fn new(
        store: Arc<TokenStore>,
        transport: Arc<dyn HttpTransport>,
        config: &HarborConfig,
    ) -> HarborResult<Self> {
        let refresh_url = config
            .base_url
            .join(REFRESH_PATH)
            .map_err(|e| HarborError::Configuration(format!("Invalid refresh URL: {}", e)))?;
        Ok(Self {
            store,
            transport,
            refresh_url,
            refresh_margin: config.refresh_margin,
            timeout: config.timeout,
            in_flight: Mutex::new(None),
        })
    }

    /// Returns the underlying token store.
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Returns a valid access token, refreshing first if the stored one
    /// expires within the configured margin.
    pub async fn access_token(&self) -> Result<AccessToken, AuthError> {
        let tokens = self.store.current().await.ok_or(AuthError::NoCredentials)?;
        let token = AccessToken {
            token: tokens.access_token,
            expires_at: tokens.expires_at,
        };
        if !token.needs_refresh(self.refresh_margin) {
            return Ok(token);
        }
        self.refresh().await
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// Single-flight: callers arriving while an exchange is in progress
    /// await the same shared future rather than issuing a duplicate
    /// request. On failure the stored tokens are cleared.
    pub async fn refresh(&self) -> Result<AccessToken, AuthError> {
        let shared = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fut = Self::perform_refresh(
                        self.store.clone(),
                        self.transport.clone(),
                        self.refresh_url.clone(),
                        self.timeout,
                    )
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = shared.clone().await;

        // Retire the completed flight so the next expiry starts a new one.
        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().map_or(false, |f| f.ptr_eq(&shared)) {
            *slot = None;
        }

        result
    }

    async fn perform_refresh(
        store: Arc<TokenStore>,
        transport: Arc<dyn HttpTransport>,
        refresh_url: Url,
        timeout: Duration,
    ) -> Result<AccessToken, AuthError> {
        let tokens = store.current().await.ok_or(AuthError::NoCredentials)?;

        let body = RefreshRequest {
            refresh_token: tokens.refresh_token.expose_secret(),
            grant_type: "refresh_token",
        };
        let body = serde_json::to_vec(&body)
            .map_err(|e| AuthError::RefreshFailed(format!("Encoding refresh request: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let request = HttpRequest {
            method: reqwest::Method::POST,
            url: refresh_url,
            headers,
            body: Some(Bytes::from(body)),
            timeout: Some(timeout),
        };

        let response = match transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                store.clear().await.ok();
                return Err(AuthError::RefreshFailed(format!("Exchange failed: {}", e)));
            }
        };

        if !response.status.is_success() {
            tracing::warn!(status = %response.status, "Token refresh rejected");
            store.clear().await.ok();
            return Err(AuthError::RefreshFailed(format!(
                "Exchange failed with status {}",
                response.status
            )));
        }

        let parsed: RefreshResponse = serde_json::from_slice(&response.body).map_err(|e| {
            AuthError::RefreshFailed(format!("Malformed refresh response: {}", e))
        })?;

        let expires_at = Utc::now() + ChronoDuration::seconds(parsed.expires_in);
        let refresh_token = parsed
            .refresh_token
            .map(SecretString::new)
            .unwrap_or(tokens.refresh_token);

        let new_tokens = AuthTokens {
            access_token: SecretString::new(parsed.access_token),
            refresh_token,
            expires_at,
            user_id: tokens.user_id,
        };
        let access = AccessToken {
            token: new_tokens.access_token.clone(),
            expires_at,
        };
        store.save(new_tokens).await?;

        tracing::debug!("Access token refreshed");
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockSecureStore, MockTransport, ScriptedResponse};

    fn config() -> HarborConfig {
        HarborConfig::builder()
            .base_url("https://api.harbor.example")
            .build()
            .unwrap()
    }

    fn expired_tokens() -> AuthTokens {
        AuthTokens::new(
            "stale-access",
            "refresh-1",
            Utc::now() - ChronoDuration::minutes(1),
            "user-1",
        )
    }

    fn refresh_body(access: &str) -> String {
        format!(
            r#"{{"access_token":"{}","refresh_token":"refresh-2","expires_in":3600}}"#,
            access
        )
    }

    #[test]
    fn test_needs_refresh_margin() {
        let token = AccessToken {
            token: SecretString::new("t".to_string()),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        };
        assert!(!token.needs_refresh(Duration::from_secs(300)));

        let token = AccessToken {
            token: SecretString::new("t".to_string()),
            expires_at: Utc::now() + ChronoDuration::minutes(4),
        };
        assert!(token.needs_refresh(Duration::from_secs(300)));

        let token = AccessToken {
            token: SecretString::new("t".to_string()),
            expires_at: Utc::now() - ChronoDuration::hours(1),
        };
        assert!(token.needs_refresh(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let secure = Arc::new(MockSecureStore::new());
        let store = TokenStore::new(secure.clone());

        assert!(store.current().await.is_none());

        let tokens = AuthTokens::new(
            "access-1",
            "refresh-1",
            Utc::now() + ChronoDuration::hours(1),
            "user-1",
        );
        store.save(tokens).await.unwrap();
        assert_eq!(store.user_id().await.as_deref(), Some("user-1"));

        // A fresh store over the same backing sees the persisted record.
        let reloaded = TokenStore::new(secure);
        reloaded.load().await.unwrap();
        let current = reloaded.current().await.unwrap();
        assert_eq!(current.access_token.expose_secret(), "access-1");

        reloaded.clear().await.unwrap();
        assert!(!reloaded.has_credentials().await);
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let secure = Arc::new(MockSecureStore::new());
        let store = Arc::new(TokenStore::new(secure));
        store
            .save(AuthTokens::new(
                "access-1",
                "refresh-1",
                Utc::now() + ChronoDuration::hours(1),
                "user-1",
            ))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::new());
        let manager = TokenManager::new(store, transport.clone(), &config()).unwrap();

        let token = manager.access_token().await.unwrap();
        assert_eq!(token.token.expose_secret(), "access-1");
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_refresh() {
        let secure = Arc::new(MockSecureStore::new());
        let store = Arc::new(TokenStore::new(secure));
        store.save(expired_tokens()).await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.push(ScriptedResponse::ok(&refresh_body("access-2")).delayed_ms(20));
        // Any further refresh attempts would consume this poison pill.
        transport.push(ScriptedResponse::status(500, "unexpected second refresh"));

        let manager = Arc::new(TokenManager::new(store, transport.clone(), &config()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.access_token().await }));
        }

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.token.expose_secret(), "access-2");
        }
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_tokens() {
        let secure = Arc::new(MockSecureStore::new());
        let store = Arc::new(TokenStore::new(secure));
        store.save(expired_tokens()).await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.push(ScriptedResponse::status(401, "revoked"));

        let manager = TokenManager::new(store.clone(), transport, &config()).unwrap();

        let result = manager.access_token().await;
        assert!(matches!(result, Err(AuthError::RefreshFailed(_))));
        assert!(!store.has_credentials().await);
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_persisted() {
        let secure = Arc::new(MockSecureStore::new());
        let store = Arc::new(TokenStore::new(secure.clone()));
        store.save(expired_tokens()).await.unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.push(ScriptedResponse::ok(&refresh_body("access-2")));

        let manager = TokenManager::new(store.clone(), transport, &config()).unwrap();
        manager.access_token().await.unwrap();

        let current = store.current().await.unwrap();
        assert_eq!(current.refresh_token.expose_secret(), "refresh-2");
        assert_eq!(current.user_id, "user-1");
        // One write for the seed save, one for the refresh cycle.
        assert_eq!(secure.put_count(), 2);
    }
}
