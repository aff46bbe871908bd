//! Durable request queue storage.
//!
//! The store is a transactional object store keyed by an auto-increment id.
//! Every trait method is one transaction: a mutation either fully lands or
//! does not happen, and concurrent enqueue/drain never observe a partially
//! written record.
//!
//! Two implementations ship with the crate: [`MemoryQueueStore`] for tests
//! and hosts that plug in their own persistence, and [`FileQueueStore`], a
//! JSON-snapshot store that makes the queue survive process restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::Mutex;

use super::error::{DecodeSnafu, EncodeSnafu, IoSnafu, QueueError};
use super::transport::RequestParts;

/// One persisted request awaiting redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: u64,
    pub request: RequestParts,
    pub priority: u8,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Transactional store for [`QueuedRequest`] records.
///
/// `add` assigns the id and the enqueue timestamp; ids are never reused
/// within one store, so `(priority, enqueued_at_ms, id)` gives a total
/// redelivery order even when two requests land in the same millisecond.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn add(&self, request: RequestParts, priority: u8) -> Result<u64, QueueError>;
    async fn get(&self, id: u64) -> Result<Option<QueuedRequest>, QueueError>;
    /// Replaces an existing record in place. Fails with
    /// [`QueueError::Missing`] when the id is unknown (e.g. deleted by a
    /// concurrent drain).
    async fn put(&self, record: &QueuedRequest) -> Result<(), QueueError>;
    async fn delete(&self, id: u64) -> Result<(), QueueError>;
    async fn list(&self) -> Result<Vec<QueuedRequest>, QueueError>;
    async fn len(&self) -> Result<usize, QueueError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    entries: BTreeMap<u64, QueuedRequest>,
}

impl StoreState {
    fn insert(&mut self, request: RequestParts, priority: u8) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            QueuedRequest {
                id,
                request,
                priority,
                enqueued_at_ms: unix_millis(),
                retry_count: 0,
            },
        );
        id
    }
}

/// In-memory [`QueueStore`].
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<StoreState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn add(&self, request: RequestParts, priority: u8) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.insert(request, priority))
    }

    async fn get(&self, id: u64) -> Result<Option<QueuedRequest>, QueueError> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn put(&self, record: &QueuedRequest) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(QueueError::Missing { id: record.id }),
        }
    }

    async fn delete(&self, id: u64) -> Result<(), QueueError> {
        self.state.lock().await.entries.remove(&id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        Ok(self.state.lock().await.entries.values().cloned().collect())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.entries.len())
    }
}

/// File-backed [`QueueStore`] persisting a JSON snapshot of the whole queue.
///
/// The snapshot is rewritten on every mutation via write-to-temp-then-rename,
/// so a crash mid-write leaves the previous snapshot intact. The queue is
/// small by construction (a client backlog, not a broker), which keeps the
/// full rewrite cheap.
pub struct FileQueueStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileQueueStore {
    /// Opens the store, loading any snapshot a previous process left behind.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).context(DecodeSnafu)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e).context(IoSnafu),
        };
        let restored = state.entries.len();
        if restored > 0 {
            info!(
                target: "adaptive_traffic::queue",
                restored,
                path = %path.display(),
                "restored queued requests from snapshot"
            );
        }
        Ok(Self { path, state: Mutex::new(state) })
    }

    async fn persist(&self, state: &StoreState) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(state).context(EncodeSnafu)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await.context(IoSnafu)?;
        tokio::fs::rename(&tmp, &self.path).await.context(IoSnafu)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn add(&self, request: RequestParts, priority: u8) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let id = state.insert(request, priority);
        self.persist(&state).await?;
        Ok(id)
    }

    async fn get(&self, id: u64) -> Result<Option<QueuedRequest>, QueueError> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn put(&self, record: &QueuedRequest) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&record.id) {
            Some(slot) => *slot = record.clone(),
            None => return Err(QueueError::Missing { id: record.id }),
        }
        self.persist(&state).await
    }

    async fn delete(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.entries.remove(&id).is_some() {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        Ok(self.state.lock().await.entries.values().cloned().collect())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_auto_increment_and_records_round_trip() {
        let store = MemoryQueueStore::new();
        let a = store.add(RequestParts::get("https://x.test/a"), 1).await.unwrap();
        let b = store.add(RequestParts::get("https://x.test/b"), 5).await.unwrap();
        assert!(b > a);

        let mut record = store.get(a).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
        record.retry_count = 3;
        store.put(&record).await.unwrap();
        assert_eq!(store.get(a).await.unwrap().unwrap().retry_count, 3);

        store.delete(a).await.unwrap();
        assert!(store.get(a).await.unwrap().is_none());
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_of_a_deleted_record_reports_missing() {
        let store = MemoryQueueStore::new();
        let id = store.add(RequestParts::get("https://x.test"), 0).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        store.delete(id).await.unwrap();
        assert!(matches!(
            store.put(&record).await,
            Err(QueueError::Missing { id: missing }) if missing == id
        ));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let store = FileQueueStore::open(&path).await.unwrap();
        let id = store
            .add(RequestParts::post("https://x.test/deals", b"{}".to_vec()), 4)
            .await
            .unwrap();
        let mut record = store.get(id).await.unwrap().unwrap();
        record.retry_count = 2;
        store.put(&record).await.unwrap();
        drop(store);

        let reopened = FileQueueStore::open(&path).await.unwrap();
        let restored = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(restored.retry_count, 2);
        assert_eq!(restored.priority, 4);
        assert_eq!(restored.request.url, "https://x.test/deals");

        // ids keep incrementing past restored records
        let next = reopened.add(RequestParts::get("https://x.test/next"), 0).await.unwrap();
        assert!(next > id);
    }
}
