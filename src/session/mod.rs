//! Authentication session state machine.
//!
//! The session layer owns the login/logout lifecycle above the
//! dispatcher. State is published through a `watch` channel so UI code
//! can react to transitions, including forced logouts triggered by a
//! failed token refresh or a server that rejects freshly refreshed
//! credentials. Logout is unconditional: the server call is best-effort,
//! local credentials and cached responses are always destroyed.

use crate::auth::{AuthTokens, TokenStore};
use crate::cache::ResponseCache;
use crate::dispatcher::Dispatcher;
use crate::errors::{HarborError, HarborResult};
use crate::request::ApiRequest;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const LOGOUT_PATH: &str = "/auth/logout";
const SESSION_PATH: &str = "/auth/session";

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    /// Persisted credentials have not been loaded yet.
    Loading,
    /// Valid credentials are stored for this user.
    Authenticated {
        /// Authenticated user id.
        user_id: String,
    },
    /// No credentials; only unauthenticated calls are possible.
    Unauthenticated,
    /// A logout is in progress; the local teardown has not finished yet.
    LoggingOut,
    /// Credential storage is unusable; re-authentication cannot help
    /// until the underlying store recovers.
    Failed {
        /// What broke.
        reason: String,
    },
}

impl Session {
    /// Returns true if the session holds credentials.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Session::Authenticated { .. })
    }
}

/// Profile returned by the auth endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    /// Stable user id.
    pub id: String,
    /// Display name.
    pub display_name: String,
    /// Account email.
    pub email: String,
}

/// New-account details for registration.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    /// Account email.
    pub email: String,
    /// Password.
    pub password: String,
    /// Display name.
    pub display_name: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthExchange {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: UserProfile,
}

/// Login/logout lifecycle over the dispatcher.
pub struct AuthSession {
    dispatcher: Arc<Dispatcher>,
    tokens: Arc<TokenStore>,
    cache: Arc<ResponseCache>,
    state: watch::Sender<Session>,
}

impl AuthSession {
    /// Creates a session in the `Loading` state; call
    /// [`Self::bootstrap`] to resolve it.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        tokens: Arc<TokenStore>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let (state, _) = watch::channel(Session::Loading);
        Self {
            dispatcher,
            tokens,
            cache,
            state,
        }
    }

    /// Restores the session from persisted credentials at startup.
    ///
    /// Presence of a token record is enough to enter `Authenticated`;
    /// validity is confirmed lazily by the first request and by the
    /// periodic check.
    pub async fn bootstrap(&self) -> HarborResult<()> {
        if let Err(e) = self.tokens.load().await {
            self.transition(Session::Failed {
                reason: e.to_string(),
            });
            return Err(e.into());
        }
        match self.tokens.user_id().await {
            Some(user_id) => {
                tracing::info!(%user_id, "Session restored from stored credentials");
                self.transition(Session::Authenticated { user_id });
            }
            None => self.transition(Session::Unauthenticated),
        }
        Ok(())
    }

    /// Exchanges credentials for a token pair and enters `Authenticated`.
    pub async fn login(&self, email: &str, password: &str) -> HarborResult<UserProfile> {
        let body = serde_json::to_value(LoginRequest { email, password })
            .map_err(|e| HarborError::Decoding(format!("Login request: {}", e)))?;
        self.authenticate(ApiRequest::post(LOGIN_PATH).no_auth().json(body))
            .await
    }

    /// Creates an account, then enters `Authenticated` with the returned
    /// token pair.
    pub async fn register(&self, registration: &Registration) -> HarborResult<UserProfile> {
        self.authenticate(ApiRequest::post(REGISTER_PATH).no_auth().json(registration))
            .await
    }

    async fn authenticate(&self, request: ApiRequest) -> HarborResult<UserProfile> {
        let exchange = match self.dispatcher.send_immediate(request).await {
            Ok(bytes) => serde_json::from_slice::<AuthExchange>(&bytes)
                .map_err(|e| HarborError::Decoding(format!("Auth response: {}", e))),
            Err(e) => Err(e),
        };
        let exchange = match exchange {
            Ok(exchange) => exchange,
            Err(e) => {
                self.transition(Session::Unauthenticated);
                return Err(e);
            }
        };

        let expires_at = Utc::now() + ChronoDuration::seconds(exchange.expires_in);
        let saved = self
            .tokens
            .save(AuthTokens::new(
                exchange.access_token,
                exchange.refresh_token,
                expires_at,
                exchange.user.id.clone(),
            ))
            .await;
        if let Err(e) = saved {
            // Credentials cannot be persisted; the session is unusable.
            self.transition(Session::Failed {
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        tracing::info!(user_id = %exchange.user.id, "Authenticated");
        self.transition(Session::Authenticated {
            user_id: exchange.user.id.clone(),
        });
        Ok(exchange.user)
    }

    /// Logs out.
    ///
    /// The server is notified best-effort; regardless of the outcome the
    /// stored credentials and the response cache are destroyed and the
    /// session ends `Unauthenticated`.
    pub async fn logout(&self) {
        self.transition(Session::LoggingOut);

        if let Err(e) = self
            .dispatcher
            .send_immediate(ApiRequest::post(LOGOUT_PATH))
            .await
        {
            tracing::warn!(error = %e, "Server-side logout failed, clearing locally");
        }

        self.teardown().await;
    }

    /// Forces a logout without a server call.
    ///
    /// Invoked when a request surfaces an auth failure (a rejected
    /// refreshed token, or a failed refresh exchange).
    pub async fn force_logout(&self, reason: &HarborError) {
        if !self.state.borrow().is_authenticated() {
            return;
        }
        tracing::warn!(error = %reason, "Forcing logout");
        self.teardown().await;
    }

    /// Confirms the stored credentials are still honored by the server.
    ///
    /// Run periodically; a surfaced auth failure forces a logout so
    /// revocation is noticed without waiting for user activity.
    pub async fn check_validity(&self) {
        if !self.state.borrow().is_authenticated() {
            return;
        }
        if let Err(e) = self
            .dispatcher
            .send_immediate(ApiRequest::get(SESSION_PATH))
            .await
        {
            if e.is_auth_failure() {
                self.force_logout(&e).await;
            }
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> Session {
        self.state.borrow().clone()
    }

    /// Returns the authenticated user id, if any.
    pub async fn user_id(&self) -> Option<String> {
        self.tokens.user_id().await
    }

    /// Subscribes to session state transitions.
    ///
    /// The channel delivers the latest state, not every intermediate
    /// one: a subscriber that polls slower than the session transitions
    /// sees the states coalesced and may skip a short-lived state such
    /// as [`Session::LoggingOut`]. Order is never inverted. Consumers
    /// that must act on a specific transient state should do so from
    /// the method that enters it, not from this channel.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    async fn teardown(&self) {
        if let Err(e) = self.tokens.clear().await {
            tracing::warn!(error = %e, "Failed to clear stored credentials");
        }
        self.cache.clear();
        self.transition(Session::Unauthenticated);
    }

    fn transition(&self, next: Session) {
        // send_replace keeps publishing even with no subscribers. A
        // slow subscriber observes only the latest value (see
        // `subscribe`); the tracing line below records every
        // transition regardless.
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Session transition");
        }
    }
}
