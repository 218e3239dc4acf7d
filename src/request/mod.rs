//! Logical API requests.
//!
//! An [`ApiRequest`] describes one call against the Harbor backend in
//! transport-independent terms. Requests are built through a consuming
//! chain and are immutable afterwards; they serialize so the offline
//! queue can persist them across process restarts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP method for a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// GET method.
    Get,
    /// POST method.
    Post,
    /// PUT method.
    Put,
    /// DELETE method.
    Delete,
}

impl Method {
    /// Returns true for methods that mutate server state.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Delete)
    }

    /// Returns the method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Logical partition of API paths sharing one circuit-breaker state.
///
/// Grouping is per subsystem so a failing backend area does not block
/// unrelated calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointGroup {
    /// Authentication endpoints (`/auth/...`).
    Auth,
    /// Social feed endpoints (`/feed/...`).
    Feed,
    /// Marketplace listings and search (`/marketplace/...`, `/listings/...`).
    Marketplace,
    /// Everything else (profile, settings, messaging).
    Account,
}

impl EndpointGroup {
    /// Resolves the endpoint group for an API path.
    pub fn for_path(path: &str) -> Self {
        let trimmed = path.trim_start_matches('/');
        let first = trimmed.split('/').next().unwrap_or("");
        match first {
            "auth" => EndpointGroup::Auth,
            "feed" => EndpointGroup::Feed,
            "marketplace" | "listings" => EndpointGroup::Marketplace,
            _ => EndpointGroup::Account,
        }
    }
}

impl std::fmt::Display for EndpointGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointGroup::Auth => write!(f, "auth"),
            EndpointGroup::Feed => write!(f, "feed"),
            EndpointGroup::Marketplace => write!(f, "marketplace"),
            EndpointGroup::Account => write!(f, "account"),
        }
    }
}

/// Cache behavior for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CachePolicy {
    /// Never cached.
    #[default]
    None,
    /// Response may be served from cache while younger than `max_age`,
    /// and conditionally revalidated afterwards.
    Cacheable {
        /// Freshness window.
        max_age: Duration,
    },
}

impl CachePolicy {
    /// Returns the freshness window if the request is cacheable.
    pub fn max_age(&self) -> Option<Duration> {
        match self {
            CachePolicy::None => None,
            CachePolicy::Cacheable { max_age } => Some(*max_age),
        }
    }
}

/// A logical request against the Harbor backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// API path relative to the base URL, e.g. `/feed/home`.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
    /// Whether a bearer token must be attached.
    pub requires_auth: bool,
    /// Caller-supplied key deduplicating retried or re-queued mutations.
    pub idempotency_key: Option<String>,
    /// Cache behavior.
    pub cache_policy: CachePolicy,
}

impl ApiRequest {
    /// Starts a GET request. Authenticated by default.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Starts a POST request. Authenticated by default.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Starts a PUT request. Authenticated by default.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    /// Starts a DELETE request. Authenticated by default.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_auth: true,
            idempotency_key: None,
            cache_policy: CachePolicy::None,
        }
    }

    /// Adds a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    ///
    /// A body that fails to serialize is rejected: debug builds panic,
    /// release builds log and send the request without a body rather
    /// than failing the dispatch outright.
    pub fn json(mut self, body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => self.body = Some(value),
            Err(e) => {
                debug_assert!(false, "unserializable request body: {}", e);
                tracing::warn!(error = %e, path = %self.path, "Dropping unserializable request body");
                self.body = None;
            }
        }
        self
    }

    /// Marks the request as unauthenticated (no bearer token attached).
    pub fn no_auth(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    /// Sets the idempotency key, marking the mutation safe to retry and
    /// deduplicating it in the offline queue.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Marks the response cacheable for `max_age`.
    pub fn cacheable(mut self, max_age: Duration) -> Self {
        self.cache_policy = CachePolicy::Cacheable { max_age };
        self
    }

    /// Returns the endpoint group this request belongs to.
    pub fn group(&self) -> EndpointGroup {
        EndpointGroup::for_path(&self.path)
    }

    /// Returns true if the request may be safely retried.
    ///
    /// GET is always idempotent; mutations only when the caller supplied
    /// an idempotency key.
    pub fn is_idempotent(&self) -> bool {
        !self.method.is_mutation() || self.idempotency_key.is_some()
    }

    /// Normalized request signature: method, path, and sorted query.
    ///
    /// Bodies never participate; only GET responses are cached.
    pub fn signature(&self) -> String {
        let mut query = self.query.clone();
        query.sort();
        if query.is_empty() {
            format!("{} {}", self.method.as_str(), self.path)
        } else {
            let encoded = serde_urlencoded::to_string(&query).unwrap_or_default();
            format!("{} {}?{}", self.method.as_str(), self.path, encoded)
        }
    }

    /// Signature prefix used for invalidating all cached views of a path.
    pub fn signature_prefix(path: &str) -> String {
        format!("{} {}", Method::Get.as_str(), path)
    }
}
