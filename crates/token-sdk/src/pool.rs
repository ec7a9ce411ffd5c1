//! Per-model FIFO pool of ready-to-spend (token, signature) pairs.
//!
//! The pool is the only shared mutable state in the token core. Every
//! mutation is a read-modify-write of one model's queue under a single
//! async mutex, so concurrent pops can never hand out the same entry.
//! Storage is pluggable: an in-memory map for tests, a file-per-model
//! directory for production.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::{Result, TokenError};

/// One pre-minted token and its finalized signature, both standard base64.
/// Stored together, spent together, never partially consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPoolEntry {
    pub token: String,
    pub signed_token: String,
}

/// Key-value storage underneath the pool. Implementations must be safe for
/// concurrent use; ordering and atomicity are the pool's job, not theirs.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// File-per-key backend so pooled tokens survive restarts.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| TokenError::Storage(format!("Failed to create pool dir: {}", e)))?;
        Ok(Self { dir })
    }

    // Hex-encoded so distinct keys can never collide on one file, whatever
    // characters a model id contains.
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

#[async_trait]
impl PoolBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TokenError::Storage(format!("Failed to read pool file: {}", e))),
        }
    }

    // Write-to-temp-then-rename: a crash mid-write leaves the old queue
    // intact instead of a half-written file.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)
            .map_err(|e| TokenError::Storage(format!("Failed to write pool file: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| TokenError::Storage(format!("Failed to commit pool file: {}", e)))
    }
}

pub struct TokenPool {
    backend: Arc<dyn PoolBackend>,
    // Serializes every read-modify-write across all models. Pool traffic
    // is light; a per-model lock map is not worth the bookkeeping.
    guard: Mutex<()>,
}

impl TokenPool {
    pub fn new(backend: Arc<dyn PoolBackend>) -> Self {
        Self {
            backend,
            guard: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn key(model: &str) -> String {
        format!("pool/{}", model)
    }

    async fn read_queue(&self, model: &str) -> Result<VecDeque<TokenPoolEntry>> {
        match self.backend.get(&Self::key(model)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TokenError::Serialization(format!("Corrupt pool entry: {}", e))),
            None => Ok(VecDeque::new()),
        }
    }

    /// An unreadable or corrupt queue degrades to an empty one: the caller
    /// falls back to a synchronous mint instead of being stuck behind a
    /// storage error, and the next push overwrites the bad state.
    async fn read_queue_or_empty(&self, model: &str) -> VecDeque<TokenPoolEntry> {
        match self.read_queue(model).await {
            Ok(queue) => queue,
            Err(e) => {
                warn!(model, error = %e, "unreadable pool queue, treating as empty");
                VecDeque::new()
            }
        }
    }

    async fn write_queue(&self, model: &str, queue: &VecDeque<TokenPoolEntry>) -> Result<()> {
        let bytes = serde_json::to_vec(queue)
            .map_err(|e| TokenError::Serialization(e.to_string()))?;
        self.backend.set(&Self::key(model), bytes).await
    }

    /// Current pool length. Never fails; a broken backend reads as empty.
    pub async fn len(&self, model: &str) -> usize {
        self.read_queue_or_empty(model).await.len()
    }

    /// Appends to the tail. The entry is durably stored before this
    /// returns.
    pub async fn push(&self, model: &str, entry: TokenPoolEntry) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut queue = self.read_queue_or_empty(model).await;
        queue.push_back(entry);
        self.write_queue(model, &queue).await
    }

    /// Removes and returns the oldest entry. An empty pool is a routine
    /// condition, not an error, and storage trouble reads as empty too —
    /// the pool never stands between the caller and a fresh mint.
    pub async fn pop(&self, model: &str) -> Option<TokenPoolEntry> {
        let _guard = self.guard.lock().await;
        let mut queue = self.read_queue_or_empty(model).await;
        let entry = queue.pop_front()?;
        if let Err(e) = self.write_queue(model, &queue).await {
            // The removal was not durable. Leave the entry pooled rather
            // than risk handing it out twice.
            warn!(model, error = %e, "failed to persist pool removal, treating as empty");
            return None;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn entry(tag: &str) -> TokenPoolEntry {
        TokenPoolEntry {
            token: format!("token-{}", tag),
            signed_token: format!("sig-{}", tag),
        }
    }

    #[tokio::test]
    async fn pop_on_empty_pool_is_none_not_error() {
        let pool = TokenPool::in_memory();
        assert_eq!(pool.pop("gpt-test").await, None);
        assert_eq!(pool.len("gpt-test").await, 0);
    }

    #[tokio::test]
    async fn entries_come_back_in_fifo_order() {
        let pool = TokenPool::in_memory();
        for tag in ["a", "b", "c"] {
            pool.push("gpt-test", entry(tag)).await.unwrap();
        }

        assert_eq!(pool.pop("gpt-test").await.unwrap().token, "token-a");
        assert_eq!(pool.pop("gpt-test").await.unwrap().token, "token-b");
        assert_eq!(pool.pop("gpt-test").await.unwrap().token, "token-c");
        assert_eq!(pool.pop("gpt-test").await, None);
    }

    #[tokio::test]
    async fn pools_are_isolated_per_model() {
        let pool = TokenPool::in_memory();
        pool.push("model-a", entry("a")).await.unwrap();
        pool.push("model-b", entry("b")).await.unwrap();

        assert_eq!(pool.len("model-a").await, 1);
        assert_eq!(pool.pop("model-b").await.unwrap().token, "token-b");
        assert_eq!(pool.len("model-a").await, 1);
    }

    #[tokio::test]
    async fn corrupt_queue_reads_as_empty_and_heals_on_push() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set("pool/gpt-test", b"not json".to_vec())
            .await
            .unwrap();
        let pool = TokenPool::new(backend);

        // Corruption is not a caller-visible failure.
        assert_eq!(pool.pop("gpt-test").await, None);
        assert_eq!(pool.len("gpt-test").await, 0);

        // The next push replaces the bad state.
        pool.push("gpt-test", entry("fresh")).await.unwrap();
        assert_eq!(pool.pop("gpt-test").await.unwrap().token, "token-fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pops_deliver_each_entry_at_most_once() {
        let pool = Arc::new(TokenPool::in_memory());
        let n = 8;
        for i in 0..n {
            pool.push("gpt-test", entry(&i.to_string())).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..n * 2 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.pop("gpt-test").await }));
        }

        let mut seen = HashSet::new();
        let mut hits = 0;
        for handle in handles {
            if let Some(entry) = handle.await.unwrap() {
                hits += 1;
                assert!(seen.insert(entry.token), "entry delivered twice");
            }
        }
        assert_eq!(hits, n);
        assert_eq!(pool.len("gpt-test").await, 0);
    }

    #[tokio::test]
    async fn file_backend_keeps_tricky_model_ids_apart() {
        let dir = std::env::temp_dir().join(format!(
            "veiltoken-pool-names-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        let pool = TokenPool::new(Arc::new(FileBackend::new(&dir).unwrap()));

        // "a/b" and "a_b" must not share a pool file.
        pool.push("a/b", entry("slash")).await.unwrap();
        pool.push("a_b", entry("underscore")).await.unwrap();

        assert_eq!(pool.pop("a/b").await.unwrap().token, "token-slash");
        assert_eq!(pool.pop("a_b").await.unwrap().token, "token-underscore");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn file_backend_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "veiltoken-pool-test-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));

        {
            let pool = TokenPool::new(Arc::new(FileBackend::new(&dir).unwrap()));
            pool.push("gpt-test", entry("persisted")).await.unwrap();
        }

        let pool = TokenPool::new(Arc::new(FileBackend::new(&dir).unwrap()));
        assert_eq!(pool.len("gpt-test").await, 1);
        assert_eq!(
            pool.pop("gpt-test").await.unwrap().token,
            "token-persisted"
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
