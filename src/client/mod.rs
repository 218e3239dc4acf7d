//! Client composition root.
//!
//! [`HarborClient`] wires the dispatcher, token lifecycle, resilience
//! state, cache, connectivity monitor, and offline queue together, and
//! owns the background tasks: cache revalidation, the periodic session
//! validity check, and draining the offline queue when connectivity
//! returns. Construct one per process and share it.

use crate::auth::{SecureStore, TokenManager, TokenStore};
use crate::cache::ResponseCache;
use crate::config::HarborConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::dispatcher::{Dispatched, Dispatcher};
use crate::errors::{HarborError, HarborResult, TransportError};
use crate::observability::{EventSink, TracingSink};
use crate::queue::OfflineQueue;
use crate::request::ApiRequest;
use crate::resilience::BreakerRegistry;
use crate::revalidator::Revalidator;
use crate::session::AuthSession;
use crate::transport::{HttpTransport, ReqwestTransport};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Resilient API client for the Harbor backend.
pub struct HarborClient {
    config: HarborConfig,
    dispatcher: Arc<Dispatcher>,
    session: Arc<AuthSession>,
    tokens: Arc<TokenStore>,
    cache: Arc<ResponseCache>,
    breakers: Arc<BreakerRegistry>,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<OfflineQueue>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl HarborClient {
    /// Creates a client over a default TLS transport.
    ///
    /// The secure store is supplied by the host platform (keychain or
    /// keystore). Call [`Self::start`] afterwards to load persisted state
    /// and launch the background tasks.
    pub fn new(config: HarborConfig, secure_store: Arc<dyn SecureStore>) -> HarborResult<Self> {
        let transport = ReqwestTransport::with_connect_timeout(config.connect_timeout)
            .map_err(|e: TransportError| HarborError::Configuration(e.to_string()))?;
        Self::with_transport(config, Arc::new(transport), secure_store, Arc::new(TracingSink))
    }

    /// Creates a client over a caller-supplied transport and event sink.
    pub fn with_transport(
        config: HarborConfig,
        transport: Arc<dyn HttpTransport>,
        secure_store: Arc<dyn SecureStore>,
        events: Arc<dyn EventSink>,
    ) -> HarborResult<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenStore::new(secure_store));
        let manager = Arc::new(TokenManager::new(tokens.clone(), transport.clone(), &config)?);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache_budget_bytes));
        let connectivity = Arc::new(ConnectivityMonitor::default());
        let queue = Arc::new(OfflineQueue::new(config.queue_path.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            transport,
            manager,
            breakers.clone(),
            cache.clone(),
            connectivity.clone(),
            queue.clone(),
            events,
        ));
        let session = Arc::new(AuthSession::new(
            dispatcher.clone(),
            tokens.clone(),
            cache.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            dispatcher,
            session,
            tokens,
            cache,
            breakers,
            connectivity,
            queue,
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Loads persisted state and launches the background tasks.
    pub async fn start(&self) -> HarborResult<()> {
        self.queue.load().await?;
        self.session.bootstrap().await?;

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_revalidator());
        tasks.push(self.spawn_drain_on_reconnect());
        if let Some(interval) = self.config.session_check_interval {
            tasks.push(self.spawn_session_check(interval));
        }
        Ok(())
    }

    /// Dispatches a request and decodes the JSON payload.
    ///
    /// An auth failure surfaced here (rejected refreshed token or failed
    /// refresh exchange) forces a logout before the error is returned.
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> HarborResult<Dispatched<T>> {
        let result = self.dispatcher.send(request).await;
        if let Err(e) = &result {
            if e.is_auth_failure() {
                self.session.force_logout(e).await;
            }
        }
        result
    }

    /// Dispatches a request and returns the raw payload bytes.
    pub async fn send_raw(&self, request: ApiRequest) -> HarborResult<Dispatched<Bytes>> {
        let result = self.dispatcher.send_raw(request).await;
        if let Err(e) = &result {
            if e.is_auth_failure() {
                self.session.force_logout(e).await;
            }
        }
        result
    }

    /// Replays any queued offline mutations now. Returns the number
    /// replayed; a concurrent drain yields 0.
    pub async fn drain_queue(&self) -> HarborResult<usize> {
        let dispatcher = self.dispatcher.clone();
        self.queue
            .drain(|request| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.send_immediate(request).await.map(|_| ()) }
            })
            .await
    }

    /// Records a reachability change from the platform.
    pub fn set_connectivity(&self, state: ConnectivityState) {
        self.connectivity.set_state(state);
    }

    /// Returns the session layer (login, logout, state subscription).
    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    /// Returns the connectivity monitor.
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Returns the offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Returns the response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Returns the per-group circuit breaker registry.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Returns the token store.
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HarborConfig {
        &self.config
    }

    /// Stops the background tasks. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!("Client shut down");
    }

    fn spawn_revalidator(&self) -> JoinHandle<()> {
        let revalidator = Revalidator::new(
            self.dispatcher.clone(),
            self.cache.clone(),
            self.connectivity.clone(),
            self.config.revalidate_interval,
            self.config.revalidate_min_hits,
        );
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            revalidator.run(shutdown).await;
        })
    }

    fn spawn_drain_on_reconnect(&self) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let queue = self.queue.clone();
        let mut transitions = self.connectivity.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = transitions.recv() => {
                        match changed {
                            Ok(ConnectivityState::Online) => {
                                let dispatcher = dispatcher.clone();
                                let result = queue
                                    .drain(|request| {
                                        let dispatcher = dispatcher.clone();
                                        async move {
                                            dispatcher.send_immediate(request).await.map(|_| ())
                                        }
                                    })
                                    .await;
                                if let Err(e) = result {
                                    tracing::warn!(error = %e, "Reconnect drain failed");
                                }
                            }
                            Ok(ConnectivityState::Offline) => {}
                            // Lagged: transitions were missed, current
                            // state still decides whether to drain.
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    fn spawn_session_check(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let session = self.session.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        session.check_validity().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}
