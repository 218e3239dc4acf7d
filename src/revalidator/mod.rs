//! Background cache revalidation.
//!
//! Hot cache entries that have gone stale are refreshed ahead of demand:
//! a periodic sweep re-issues their GETs, which the dispatcher sends
//! conditionally with `If-None-Match`. A 304 re-stamps the entry for the
//! cost of a header exchange; a changed body replaces it. Sweeps are
//! best-effort and skipped entirely while offline.

use crate::cache::ResponseCache;
use crate::connectivity::ConnectivityMonitor;
use crate::dispatcher::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Periodic revalidator of stale-but-hot cache entries.
pub struct Revalidator {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<ResponseCache>,
    connectivity: Arc<ConnectivityMonitor>,
    interval: Duration,
    min_hits: u64,
}

impl Revalidator {
    /// Creates a revalidator.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        cache: Arc<ResponseCache>,
        connectivity: Arc<ConnectivityMonitor>,
        interval: Duration,
        min_hits: u64,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            connectivity,
            interval,
            min_hits,
        }
    }

    /// Runs sweeps on the configured interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a sweep never
        // races startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one revalidation pass over the stale hot entries.
    ///
    /// Failures are logged and skipped; the pass stops early if
    /// connectivity is lost partway through.
    pub async fn sweep(&self) -> usize {
        if !self.connectivity.is_online() {
            return 0;
        }

        let candidates = self.cache.stale_hot_entries(self.min_hits);
        if candidates.is_empty() {
            return 0;
        }
        tracing::debug!(count = candidates.len(), "Revalidation sweep started");

        let mut revalidated = 0;
        for request in candidates {
            if !self.connectivity.is_online() {
                break;
            }
            match self.dispatcher.send_raw(request.clone()).await {
                Ok(_) => revalidated += 1,
                Err(e) => {
                    tracing::debug!(path = %request.path, error = %e, "Revalidation skipped");
                }
            }
        }
        revalidated
    }
}
