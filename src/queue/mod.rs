//! Durable offline mutation queue.
//!
//! Mutations issued while offline are persisted in FIFO order and
//! replayed on reconnect. An entry is removed only after a confirmed
//! successful replay; a failure mid-drain halts the run and leaves the
//! remainder queued for the next connectivity transition. The queue file
//! is rewritten atomically (write temp, then rename) so a crash never
//! leaves a torn queue on disk.

use crate::errors::{HarborError, HarborResult};
use crate::request::ApiRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// A mutation captured while offline, awaiting replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Queue-local identity. Same-key dedup can displace an entry while
    /// its replay is in flight, so replay completion removes by id, not
    /// by queue position.
    #[serde(default)]
    pub id: u64,
    /// The original request.
    pub request: ApiRequest,
    /// Deduplication key, when the caller supplied one.
    pub idempotency_key: Option<String>,
    /// When the mutation was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Durable FIFO of mutations issued while offline.
pub struct OfflineQueue {
    path: PathBuf,
    entries: Mutex<Vec<QueuedMutation>>,
    draining: AtomicBool,
    next_id: AtomicU64,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    /// Creates a queue persisted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Loads persisted entries. Called once at startup; a missing file is
    /// an empty queue.
    pub async fn load(&self) -> HarborResult<()> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HarborError::Storage(format!("Reading queue: {}", e))),
        };
        let loaded: Vec<QueuedMutation> = serde_json::from_slice(&raw)
            .map_err(|e| HarborError::Storage(format!("Corrupt queue file: {}", e)))?;
        let max_id = loaded.iter().map(|e| e.id).max().unwrap_or(0);
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        *self.entries.lock().await = loaded;
        Ok(())
    }

    /// Appends a mutation, collapsing any earlier entry with the same
    /// idempotency key into this most recent one.
    pub async fn enqueue(&self, request: ApiRequest) -> HarborResult<()> {
        let mutation = QueuedMutation {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            idempotency_key: request.idempotency_key.clone(),
            enqueued_at: Utc::now(),
            request,
        };
        let mut entries = self.entries.lock().await;
        if let Some(key) = mutation.idempotency_key.as_deref() {
            entries.retain(|e| e.idempotency_key.as_deref() != Some(key));
        }
        entries.push(mutation);
        tracing::debug!(queued = entries.len(), "Mutation queued for replay");
        self.persist(&entries).await
    }

    /// Replays queued mutations strictly in enqueue order.
    ///
    /// Each entry is removed only after `replay` succeeds; the first
    /// failure halts the run, leaving it and everything behind it queued.
    /// At most one drain runs at a time; a concurrent call returns 0
    /// immediately. New mutations may be enqueued while draining.
    pub async fn drain<F, Fut>(&self, replay: F) -> HarborResult<usize>
    where
        F: Fn(ApiRequest) -> Fut,
        Fut: Future<Output = HarborResult<()>>,
    {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let _guard = DrainGuard(&self.draining);

        let mut processed = 0;
        loop {
            let (id, request) = {
                let entries = self.entries.lock().await;
                match entries.first() {
                    Some(entry) => (entry.id, entry.request.clone()),
                    None => break,
                }
            };

            match replay(request).await {
                Ok(()) => {
                    let mut entries = self.entries.lock().await;
                    // Remove by identity: a same-key enqueue during the
                    // replay may have displaced the head, and the
                    // superseding entry must stay queued.
                    entries.retain(|e| e.id != id);
                    self.persist(&entries).await?;
                    processed += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, processed, "Queue drain halted");
                    break;
                }
            }
        }

        if processed > 0 {
            tracing::info!(processed, "Offline queue drained");
        }
        Ok(processed)
    }

    /// Returns a snapshot of the queued mutations.
    pub async fn peek_all(&self) -> Vec<QueuedMutation> {
        self.entries.lock().await.clone()
    }

    /// Discards one queued mutation by idempotency key (user-initiated
    /// cancel or conflict resolution).
    pub async fn discard(&self, idempotency_key: &str) -> HarborResult<bool> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.idempotency_key.as_deref() != Some(idempotency_key));
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    /// Returns the number of queued mutations.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns true if nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, entries: &[QueuedMutation]) -> HarborResult<()> {
        let json = serde_json::to_vec(entries)
            .map_err(|e| HarborError::Storage(format!("Encoding queue: {}", e)))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| HarborError::Storage(format!("Writing queue: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HarborError::Storage(format!("Replacing queue: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    fn mutation(path: &str) -> ApiRequest {
        ApiRequest::post(path).idempotency_key(path.to_string())
    }

    #[tokio::test]
    async fn test_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let queue = OfflineQueue::new(&path);
        queue.enqueue(mutation("/listings/a")).await.unwrap();
        queue.enqueue(mutation("/listings/b")).await.unwrap();

        let reloaded = OfflineQueue::new(&path);
        reloaded.load().await.unwrap();
        let entries = reloaded.peek_all().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].request.path, "/listings/a");
        assert_eq!(entries[1].request.path, "/listings/b");

        // Identities keep advancing past the persisted ones.
        reloaded.enqueue(mutation("/listings/c")).await.unwrap();
        let entries = reloaded.peek_all().await;
        assert!(entries[2].id > entries[1].id);
        assert!(entries[1].id > entries[0].id);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("absent.json"));
        queue.load().await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_replays_in_order_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("queue.json"));
        queue.enqueue(mutation("/a")).await.unwrap();
        queue.enqueue(mutation("/b")).await.unwrap();
        queue.enqueue(mutation("/c")).await.unwrap();

        let replayed = Arc::new(AsyncMutex::new(Vec::new()));
        let seen = replayed.clone();
        let processed = queue
            .drain(|request| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(request.path);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(processed, 3);
        assert_eq!(*replayed.lock().await, vec!["/a", "/b", "/c"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_halts_on_failure_leaving_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("queue.json"));
        queue.enqueue(mutation("/a")).await.unwrap();
        queue.enqueue(mutation("/b")).await.unwrap();
        queue.enqueue(mutation("/c")).await.unwrap();

        let processed = queue
            .drain(|request| async move {
                if request.path == "/b" {
                    Err(HarborError::Timeout("replay failed".to_string()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(processed, 1);
        let remaining = queue.peek_all().await;
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].request.path, "/b");
        assert_eq!(remaining[1].request.path, "/c");
    }

    #[tokio::test]
    async fn test_dedup_collapses_to_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("queue.json"));

        queue
            .enqueue(
                ApiRequest::put("/profile/me")
                    .json(serde_json::json!({"bio": "v1"}))
                    .idempotency_key("profile-update"),
            )
            .await
            .unwrap();
        queue.enqueue(mutation("/other")).await.unwrap();
        queue
            .enqueue(
                ApiRequest::put("/profile/me")
                    .json(serde_json::json!({"bio": "v2"}))
                    .idempotency_key("profile-update"),
            )
            .await
            .unwrap();

        let entries = queue.peek_all().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].request.path, "/other");
        assert_eq!(
            entries[1].request.body,
            Some(serde_json::json!({"bio": "v2"}))
        );
    }

    #[tokio::test]
    async fn test_discard_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path().join("queue.json"));
        queue.enqueue(mutation("/a")).await.unwrap();

        assert!(queue.discard("/a").await.unwrap());
        assert!(!queue.discard("/a").await.unwrap());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_same_key_enqueue_during_drain_loses_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::new(dir.path().join("queue.json")));
        queue
            .enqueue(ApiRequest::post("/a").idempotency_key("x"))
            .await
            .unwrap();
        queue
            .enqueue(ApiRequest::post("/b").idempotency_key("y"))
            .await
            .unwrap();

        let replayed = Arc::new(AsyncMutex::new(Vec::new()));
        let drain_queue = queue.clone();
        let seen = replayed.clone();
        let drain = tokio::spawn(async move {
            drain_queue
                .drain(|request| {
                    let seen = seen.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        seen.lock().await.push(request.path);
                        Ok(())
                    }
                })
                .await
        });

        // While `/a` is mid-replay, supersede it under the same key. The
        // dedup displaces the in-flight head; the superseding entry must
        // still be replayed, and `/b` must never be dropped unreplayed.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue
            .enqueue(ApiRequest::post("/a2").idempotency_key("x"))
            .await
            .unwrap();

        let processed = drain.await.unwrap().unwrap();
        assert_eq!(processed, 3);
        assert_eq!(*replayed.lock().await, vec!["/a", "/b", "/a2"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_drain_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::new(dir.path().join("queue.json")));
        queue.enqueue(mutation("/a")).await.unwrap();

        let replays = Arc::new(AtomicUsize::new(0));
        let slow_queue = queue.clone();
        let slow_replays = replays.clone();
        let slow = tokio::spawn(async move {
            slow_queue
                .drain(|_| {
                    let replays = slow_replays.clone();
                    async move {
                        replays.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = queue.drain(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(second, 0);

        assert_eq!(slow.await.unwrap().unwrap(), 1);
        assert_eq!(replays.load(Ordering::SeqCst), 1);
    }
}
