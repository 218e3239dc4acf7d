//! Error types for the Harbor network layer.

use crate::request::EndpointGroup;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result type for Harbor network operations.
pub type HarborResult<T> = Result<T, HarborError>;

/// Top-level error type surfaced by the dispatcher and session layer.
///
/// The dispatcher recovers transient failures locally (retry, circuit
/// breaker, offline queue) and only surfaces an error once local recovery
/// is exhausted. `Unauthorized` and `RefreshFailed` are never retried by
/// the dispatcher; they propagate to the session layer as a forced-logout
/// signal.
#[derive(Debug, Error)]
pub enum HarborError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No usable credentials are stored; the request was never sent.
    #[error("No usable credentials")]
    Unauthenticated,

    /// The server rejected a freshly refreshed token.
    #[error("Server rejected refreshed credentials")]
    Unauthorized,

    /// The endpoint group is short-circuited; no network call was made.
    #[error("Circuit open for endpoint group {group}")]
    CircuitOpen {
        /// The short-circuited endpoint group.
        group: EndpointGroup,
    },

    /// The request timed out at the transport level.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// The device is offline or the connection could not be established.
    #[error("No connectivity")]
    NoConnectivity,

    /// Non-retryable 4xx response (other than 401/408/429).
    #[error("Client error ({status}): {body}")]
    ClientError {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Retryable server-side failure (408/429/5xx), surfaced once the
    /// retry budget is exhausted.
    #[error("Server error ({status}): {body}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
        /// Server-supplied retry-after hint, if present.
        retry_after: Option<Duration>,
    },

    /// The response body could not be decoded.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Exchanging the refresh token for a new access token failed.
    /// Stored credentials have been cleared.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Durable storage (secure store or offline queue) failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl HarborError {
    /// Returns true if the error may be retried by the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarborError::Timeout(_) | HarborError::NoConnectivity | HarborError::ServerError { .. }
        )
    }

    /// Returns the server-supplied retry delay hint if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HarborError::ServerError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the HTTP status code if the error originated from a response.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            HarborError::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            HarborError::ClientError { status, .. } | HarborError::ServerError { status, .. } => {
                StatusCode::from_u16(*status).ok()
            }
            _ => None,
        }
    }

    /// Returns true if the error should be treated as a forced-logout
    /// signal by the session layer.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, HarborError::Unauthorized | HarborError::RefreshFailed(_))
    }
}

/// Errors from the token store and refresher.
///
/// Clone is required so concurrent callers of a single-flight refresh can
/// all observe the same failure.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No credentials are stored.
    #[error("No credentials stored")]
    NoCredentials,

    /// The refresh-token exchange failed; stored tokens were cleared.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// The secure store failed to read or write the token record.
    #[error("Secure store error: {0}")]
    Storage(String),
}

impl From<AuthError> for HarborError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NoCredentials => HarborError::Unauthenticated,
            AuthError::RefreshFailed(msg) => HarborError::RefreshFailed(msg),
            AuthError::Storage(msg) => HarborError::Storage(msg),
        }
    }
}

/// Error raised by the platform secure key-value store collaborator.
#[derive(Debug, Error)]
#[error("Secure store error: {0}")]
pub struct SecureStoreError(pub String);

impl From<SecureStoreError> for AuthError {
    fn from(err: SecureStoreError) -> Self {
        AuthError::Storage(err.0)
    }
}

/// Transport-level errors, classified before mapping to domain errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Any other HTTP-level failure (malformed response, builder error).
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}

impl From<TransportError> for HarborError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => HarborError::Timeout(msg),
            TransportError::Connection(_) => HarborError::NoConnectivity,
            TransportError::Http(msg) => HarborError::Decoding(msg),
        }
    }
}
