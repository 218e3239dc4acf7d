//! Test doubles: a scripted HTTP transport and an in-memory secure store.

use crate::errors::{SecureStoreError, TransportError};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// One scripted transport outcome.
pub struct ScriptedResponse {
    status: u16,
    body: String,
    headers: Vec<(&'static str, String)>,
    delay: Option<Duration>,
    failure: Option<ScriptedFailure>,
}

enum ScriptedFailure {
    Timeout,
    Connection,
}

impl ScriptedResponse {
    /// 200 with the given body.
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    /// Arbitrary status with the given body.
    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: Vec::new(),
            delay: None,
            failure: None,
        }
    }

    /// 304 Not Modified.
    pub fn not_modified() -> Self {
        Self::status(304, "")
    }

    /// Transport-level timeout.
    pub fn timeout() -> Self {
        Self {
            failure: Some(ScriptedFailure::Timeout),
            ..Self::status(0, "")
        }
    }

    /// Transport-level connection failure.
    pub fn connection_error() -> Self {
        Self {
            failure: Some(ScriptedFailure::Connection),
            ..Self::status(0, "")
        }
    }

    /// Adds a response header.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Delays the response by `ms` milliseconds.
    pub fn delayed_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }
}

/// A request observed by the mock transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Method name.
    pub method: String,
    /// Full URL.
    pub url: Url,
    /// Headers as sent.
    pub headers: HeaderMap,
    /// Body bytes, if any.
    pub body: Option<Bytes>,
}

impl RecordedRequest {
    /// Returns a header value as a string.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Scripted transport: responses are consumed in push order.
pub struct MockTransport {
    script: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Appends a scripted response.
    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    /// Returns the number of requests sent.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Returns the recorded requests.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Returns the most recent request.
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method.to_string(),
            url: request.url,
            headers: request.headers,
            body: request.body,
        });

        let scripted = self.script.lock().unwrap().pop_front();
        let scripted = match scripted {
            Some(scripted) => scripted,
            None => ScriptedResponse::status(500, "mock script exhausted"),
        };

        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = scripted.failure {
            return Err(match failure {
                ScriptedFailure::Timeout => TransportError::Timeout("scripted".to_string()),
                ScriptedFailure::Connection => {
                    TransportError::Connection("scripted".to_string())
                }
            });
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &scripted.headers {
            let name = HeaderName::from_static(name);
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }

        let status = StatusCode::from_u16(scripted.status)
            .map_err(|e| TransportError::Http(format!("Bad scripted status: {}", e)))?;

        Ok(HttpResponse::new(status, headers, Bytes::from(scripted.body)))
    }
}

/// In-memory secure store double.
pub struct MockSecureStore {
    values: Mutex<HashMap<String, String>>,
    puts: AtomicUsize,
}

impl MockSecureStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
        }
    }

    /// Returns the number of writes performed.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl Default for MockSecureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::auth::SecureStore for MockSecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SecureStoreError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SecureStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecureStoreError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}
