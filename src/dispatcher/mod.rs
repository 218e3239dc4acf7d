//! Authenticated request dispatcher.
//!
//! The dispatcher is the single call-site contract for the backend: it
//! resolves the endpoint group, consults the circuit breaker and response
//! cache, attaches a fresh access token, sends over the transport, and
//! classifies the outcome, driving retry, refresh-and-retry, and the
//! offline queue. Transient failures are recovered locally; an error is
//! surfaced only once local recovery is exhausted.

use crate::auth::{AccessToken, TokenManager};
use crate::cache::ResponseCache;
use crate::config::HarborConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::errors::{HarborError, HarborResult};
use crate::observability::{EventSink, FailureEvent};
use crate::queue::OfflineQueue;
use crate::request::{ApiRequest, EndpointGroup, Method};
use crate::resilience::{BreakerRegistry, RetryDecision, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, IF_NONE_MATCH, USER_AGENT,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

/// Platform identifier header.
const HEADER_PLATFORM: &str = "x-platform";
/// App version header.
const HEADER_APP_VERSION: &str = "x-app-version";
/// Idempotency key header.
const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Outcome of dispatching a request.
#[derive(Debug)]
pub enum Dispatched<T> {
    /// The request completed with a decoded payload.
    Completed(T),
    /// The device was offline; the mutation was captured in the offline
    /// queue for replay on reconnect.
    Queued,
}

impl<T> Dispatched<T> {
    /// Returns the payload if the request completed.
    pub fn completed(self) -> Option<T> {
        match self {
            Dispatched::Completed(value) => Some(value),
            Dispatched::Queued => None,
        }
    }

    /// Returns true if the mutation was queued for later replay.
    pub fn is_queued(&self) -> bool {
        matches!(self, Dispatched::Queued)
    }
}

/// Resilient request dispatcher.
pub struct Dispatcher {
    config: HarborConfig,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<OfflineQueue>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HarborConfig,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<ResponseCache>,
        connectivity: Arc<ConnectivityMonitor>,
        queue: Arc<OfflineQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            config,
            transport,
            tokens,
            breakers,
            cache,
            retry,
            connectivity,
            queue,
            events,
        }
    }

    /// Dispatches a request and decodes the JSON payload.
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> HarborResult<Dispatched<T>> {
        match self.send_raw(request).await? {
            Dispatched::Completed(bytes) => {
                let payload = serde_json::from_slice(&bytes)
                    .map_err(|e| HarborError::Decoding(format!("Response body: {}", e)))?;
                Ok(Dispatched::Completed(payload))
            }
            Dispatched::Queued => Ok(Dispatched::Queued),
        }
    }

    /// Dispatches a request and returns the raw payload bytes.
    pub async fn send_raw(&self, request: ApiRequest) -> HarborResult<Dispatched<Bytes>> {
        self.dispatch(request, true).await
    }

    /// Dispatches without offline capture: an offline failure surfaces as
    /// `NoConnectivity` instead of queueing. Used for replaying queued
    /// entries and for auth flows, which must never be queued.
    pub(crate) async fn send_immediate(&self, request: ApiRequest) -> HarborResult<Bytes> {
        match self.dispatch(request, false).await? {
            Dispatched::Completed(bytes) => Ok(bytes),
            Dispatched::Queued => Err(HarborError::NoConnectivity),
        }
    }

    async fn dispatch(
        &self,
        request: ApiRequest,
        allow_queue: bool,
    ) -> HarborResult<Dispatched<Bytes>> {
        let group = request.group();
        let mut attempts = 0;
        let result = self
            .dispatch_inner(&request, group, allow_queue, &mut attempts)
            .await;

        if let Err(error) = &result {
            // Best-effort analytics; must never affect the result.
            self.events.on_failure(FailureEvent {
                group,
                method: request.method.as_str(),
                path: request.path.clone(),
                error: error.to_string(),
                attempts,
            });
        }
        result
    }

    async fn dispatch_inner(
        &self,
        request: &ApiRequest,
        group: EndpointGroup,
        allow_queue: bool,
        attempts: &mut u32,
    ) -> HarborResult<Dispatched<Bytes>> {
        self.breakers.check(group)?;

        let signature = request.signature();
        let cacheable = request.method == Method::Get && request.cache_policy.max_age().is_some();

        // A stale entry with a validator is revalidated conditionally;
        // its payload is kept at hand to serve on 304.
        let mut conditional: Option<(String, Bytes)> = None;
        if cacheable {
            if let Some(hit) = self.cache.lookup(&signature) {
                if hit.fresh {
                    tracing::debug!(signature = %signature, "Served from cache");
                    return Ok(Dispatched::Completed(hit.payload));
                }
                if let Some(etag) = hit.etag {
                    conditional = Some((etag, hit.payload));
                }
            }
        }

        if !self.connectivity.is_online() {
            if request.method.is_mutation() && allow_queue {
                self.queue.enqueue(request.clone()).await?;
                return Ok(Dispatched::Queued);
            }
            return Err(HarborError::NoConnectivity);
        }

        let mut token = if request.requires_auth {
            Some(self.tokens.access_token().await?)
        } else {
            None
        };

        let url = self.build_url(request)?;
        let body = match &request.body {
            Some(value) => Some(Bytes::from(serde_json::to_vec(value).map_err(|e| {
                HarborError::Decoding(format!("Request body: {}", e))
            })?)),
            None => None,
        };

        let mut refreshed = false;
        loop {
            if *attempts > 0 {
                // Failures recorded below may have opened the circuit
                // between attempts.
                self.breakers.check(group)?;
            }
            *attempts += 1;

            let http = self.build_http_request(
                request,
                url.clone(),
                token.as_ref(),
                conditional.as_ref().map(|(etag, _)| etag.as_str()),
                body.clone(),
            )?;

            let error = match self.transport.send(http).await {
                Ok(response) => {
                    let status = response.status;

                    if status == StatusCode::NOT_MODIFIED {
                        if let Some((_, payload)) = conditional {
                            self.breakers.record_success(group);
                            self.cache.restamp(&signature, response.etag());
                            tracing::debug!(signature = %signature, "Revalidated from cache");
                            return Ok(Dispatched::Completed(payload));
                        }
                        return Err(HarborError::Decoding(
                            "Unexpected 304 without cache validator".to_string(),
                        ));
                    }

                    if status.is_success() {
                        self.breakers.record_success(group);
                        if cacheable {
                            if let Some(max_age) = request.cache_policy.max_age() {
                                self.cache.store(
                                    request,
                                    response.body.clone(),
                                    response.etag(),
                                    max_age,
                                );
                            }
                        }
                        if request.method.is_mutation() {
                            self.invalidate_mutated(&request.path);
                        }
                        return Ok(Dispatched::Completed(response.body));
                    }

                    if status == StatusCode::UNAUTHORIZED && request.requires_auth {
                        // The server responded; the group is not failing.
                        self.breakers.record_success(group);
                        if refreshed {
                            return Err(HarborError::Unauthorized);
                        }
                        refreshed = true;
                        token = Some(self.tokens.refresh().await?);
                        continue;
                    }

                    let error = classify_status(status, &response);
                    if !error.is_retryable() {
                        self.breakers.record_success(group);
                        return Err(error);
                    }
                    error
                }
                Err(transport_error) => {
                    let error = HarborError::from(transport_error);
                    if matches!(error, HarborError::NoConnectivity)
                        && request.method.is_mutation()
                        && allow_queue
                        && !self.connectivity.is_online()
                    {
                        // Went offline mid-flight; capture for replay.
                        self.breakers.record_failure(group);
                        self.queue.enqueue(request.clone()).await?;
                        return Ok(Dispatched::Queued);
                    }
                    error
                }
            };

            self.breakers.record_failure(group);
            match self
                .retry
                .should_retry(*attempts, &error, request.is_idempotent())
            {
                RetryDecision::After(delay) => {
                    tracing::debug!(
                        attempt = *attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::No => return Err(error),
            }
        }
    }

    fn build_url(&self, request: &ApiRequest) -> HarborResult<Url> {
        let mut url = self
            .config
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| HarborError::Configuration(format!("Invalid URL: {}", e)))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn build_http_request(
        &self,
        request: &ApiRequest,
        url: Url,
        token: Option<&AccessToken>,
        etag: Option<&str>,
        body: Option<Bytes>,
    ) -> HarborResult<HttpRequest> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .map_err(|e| HarborError::Configuration(format!("Invalid user agent: {}", e)))?,
        );
        headers.insert(
            HEADER_PLATFORM,
            HeaderValue::from_str(&self.config.platform)
                .map_err(|e| HarborError::Configuration(format!("Invalid platform: {}", e)))?,
        );
        headers.insert(
            HEADER_APP_VERSION,
            HeaderValue::from_str(&self.config.app_version)
                .map_err(|e| HarborError::Configuration(format!("Invalid app version: {}", e)))?,
        );
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&token.authorization_header())
                    .map_err(|e| HarborError::Configuration(format!("Invalid token: {}", e)))?,
            );
        }
        if let Some(etag) = etag {
            headers.insert(
                IF_NONE_MATCH,
                HeaderValue::from_str(etag)
                    .map_err(|e| HarborError::Configuration(format!("Invalid ETag: {}", e)))?,
            );
        }
        if let Some(key) = &request.idempotency_key {
            headers.insert(
                HEADER_IDEMPOTENCY_KEY,
                HeaderValue::from_str(key).map_err(|e| {
                    HarborError::Configuration(format!("Invalid idempotency key: {}", e))
                })?,
            );
        }

        Ok(HttpRequest {
            method: request.method.into(),
            url,
            headers,
            body,
            timeout: Some(self.config.timeout),
        })
    }

    /// Drops cached views of the mutated resource, so list and detail
    /// GETs under the same top-level path re-fetch.
    fn invalidate_mutated(&self, path: &str) {
        let trimmed = path.trim_start_matches('/');
        if let Some(root) = trimmed.split('/').next().filter(|s| !s.is_empty()) {
            self.cache
                .invalidate_prefix(&ApiRequest::signature_prefix(&format!("/{}", root)));
        }
    }
}

fn classify_status(status: StatusCode, response: &HttpResponse) -> HarborError {
    let body = String::from_utf8_lossy(&response.body).to_string();
    match status.as_u16() {
        408 | 429 | 500..=599 => HarborError::ServerError {
            status: status.as_u16(),
            body,
            retry_after: response.retry_after(),
        },
        _ => HarborError::ClientError {
            status: status.as_u16(),
            body,
        },
    }
}
