//! Resilient networking layer for Harbor mobile clients.
//!
//! `harbor-net` sits between app feature code and the Harbor backend and
//! absorbs the failure modes of mobile networking: flaky radios, token
//! expiry, rate limits, and backend incidents. Feature code describes a
//! call as an [`ApiRequest`] and receives either a decoded payload or a
//! single classified error once local recovery is exhausted.
//!
//! What the layer does on every call:
//!
//! - attaches a bearer token, refreshing it single-flight when it nears
//!   expiry ([`auth`])
//! - fails fast when an endpoint group's circuit is open, and retries
//!   retryable failures with exponential backoff ([`resilience`])
//! - serves fresh cached GET responses and revalidates stale ones with
//!   `If-None-Match` ([`cache`], [`revalidator`])
//! - captures mutations issued offline in a durable queue and replays
//!   them in order on reconnect ([`queue`], [`connectivity`])
//! - tracks the login lifecycle and forces a logout when the server
//!   rejects refreshed credentials ([`session`])
//!
//! # Example
//!
//! ```no_run
//! use harbor_net::{ApiRequest, Dispatched, HarborClient, HarborConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(keychain: Arc<dyn harbor_net::SecureStore>) -> harbor_net::HarborResult<()> {
//! let config = HarborConfig::builder()
//!     .base_url("https://api.harbor.example")
//!     .platform("ios")
//!     .app_version("2.4.1")
//!     .build()?;
//!
//! let client = HarborClient::new(config, keychain)?;
//! client.start().await?;
//!
//! client.session().login("sam@example.com", "hunter2").await?;
//!
//! let feed: Dispatched<serde_json::Value> = client
//!     .send(ApiRequest::get("/feed/home").cacheable(Duration::from_secs(60)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod errors;
pub mod observability;
pub mod queue;
pub mod request;
pub mod resilience;
pub mod revalidator;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mocks;

pub use auth::{AccessToken, AuthTokens, SecureStore, TokenManager, TokenStore};
pub use cache::{CachedResponse, ResponseCache};
pub use client::HarborClient;
pub use config::{HarborConfig, HarborConfigBuilder};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use dispatcher::{Dispatched, Dispatcher};
pub use errors::{AuthError, HarborError, HarborResult, SecureStoreError, TransportError};
pub use observability::{EventSink, FailureEvent, NoopSink, TracingSink};
pub use queue::{OfflineQueue, QueuedMutation};
pub use request::{ApiRequest, CachePolicy, EndpointGroup, Method};
pub use resilience::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryPolicy,
};
pub use revalidator::Revalidator;
pub use session::{AuthSession, Registration, Session, UserProfile};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
