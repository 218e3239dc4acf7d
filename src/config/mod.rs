//! Configuration for the Harbor network client.

use crate::errors::{HarborError, HarborResult};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default per-send timeout. Distinct from the retry ceiling.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default margin before token expiry at which a refresh is triggered.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Configuration for [`HarborClient`](crate::client::HarborClient).
#[derive(Clone)]
pub struct HarborConfig {
    /// Base URL for the API.
    pub base_url: Url,

    /// Per-send timeout.
    pub timeout: Duration,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Retry policy configuration.
    pub retry: RetryConfig,

    /// Circuit breaker configuration, applied per endpoint group.
    pub breaker: CircuitBreakerConfig,

    /// Margin before token expiry at which the stored access token is
    /// considered stale and refreshed.
    pub refresh_margin: Duration,

    /// Byte budget for the in-memory response cache.
    pub cache_budget_bytes: usize,

    /// Interval between background revalidation sweeps.
    pub revalidate_interval: Duration,

    /// Minimum cache hits for an entry to count as hot and be revalidated
    /// in the background.
    pub revalidate_min_hits: u64,

    /// Interval between session validity re-checks. `None` disables the
    /// periodic check; revocation is then only caught on the next request.
    pub session_check_interval: Option<Duration>,

    /// Path of the durable offline mutation queue.
    pub queue_path: PathBuf,

    /// Platform identifier sent with every request (`X-Platform`).
    pub platform: String,

    /// App version sent with every request (`X-App-Version`).
    pub app_version: String,

    /// User agent string.
    pub user_agent: String,
}

impl HarborConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> HarborConfigBuilder {
        HarborConfigBuilder::new()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> HarborResult<()> {
        // Plain HTTP is tolerated for loopback only (local test servers).
        let loopback = matches!(self.base_url.host_str(), Some("localhost") | Some("127.0.0.1"));
        if self.base_url.scheme() != "https" && !loopback {
            return Err(HarborError::Configuration(
                "Base URL must use HTTPS".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(HarborError::Configuration(
                "Timeout must be non-zero".to_string(),
            ));
        }
        if self.cache_budget_bytes == 0 {
            return Err(HarborError::Configuration(
                "Cache budget must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`HarborConfig`].
pub struct HarborConfigBuilder {
    base_url: Option<Url>,
    timeout: Duration,
    connect_timeout: Duration,
    retry: RetryConfig,
    breaker: CircuitBreakerConfig,
    refresh_margin: Duration,
    cache_budget_bytes: usize,
    revalidate_interval: Duration,
    revalidate_min_hits: u64,
    session_check_interval: Option<Duration>,
    queue_path: Option<PathBuf>,
    platform: String,
    app_version: String,
    user_agent: Option<String>,
}

impl HarborConfigBuilder {
    /// Creates a new builder with production defaults.
    pub fn new() -> Self {
        Self {
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            cache_budget_bytes: 4 * 1024 * 1024,
            revalidate_interval: Duration::from_secs(60),
            revalidate_min_hits: 2,
            session_check_interval: Some(Duration::from_secs(60)),
            queue_path: None,
            platform: "unknown".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent: None,
        }
    }

    /// Sets the base URL.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Self {
        self.base_url = Url::parse(url.as_ref()).ok();
        self
    }

    /// Sets the per-send timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the token refresh margin.
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Sets the response cache byte budget.
    pub fn cache_budget_bytes(mut self, bytes: usize) -> Self {
        self.cache_budget_bytes = bytes;
        self
    }

    /// Sets the background revalidation interval.
    pub fn revalidate_interval(mut self, interval: Duration) -> Self {
        self.revalidate_interval = interval;
        self
    }

    /// Sets the hot-entry hit threshold for background revalidation.
    pub fn revalidate_min_hits(mut self, hits: u64) -> Self {
        self.revalidate_min_hits = hits;
        self
    }

    /// Sets the session validity re-check interval, or disables it.
    pub fn session_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.session_check_interval = interval;
        self
    }

    /// Sets the durable offline queue path.
    pub fn queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_path = Some(path.into());
        self
    }

    /// Sets the platform identifier header value.
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Sets the app version header value.
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Sets the user agent string.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> HarborResult<HarborConfig> {
        let base_url = self
            .base_url
            .ok_or_else(|| HarborError::Configuration("Base URL is required".to_string()))?;

        let queue_path = self
            .queue_path
            .unwrap_or_else(|| PathBuf::from("offline-queue.json"));

        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("harbor-net/{}", env!("CARGO_PKG_VERSION")));

        let config = HarborConfig {
            base_url,
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
            retry: self.retry,
            breaker: self.breaker,
            refresh_margin: self.refresh_margin,
            cache_budget_bytes: self.cache_budget_bytes,
            revalidate_interval: self.revalidate_interval,
            revalidate_min_hits: self.revalidate_min_hits,
            session_check_interval: self.session_check_interval,
            queue_path,
            platform: self.platform,
            app_version: self.app_version,
            user_agent,
        };

        config.validate()?;

        Ok(config)
    }
}

impl Default for HarborConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
