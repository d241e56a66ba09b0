use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::path::Path;
use slatedb::{Db, WriteBatch};
use std::sync::Arc;
use tracing::info;

use crate::locks::LockFactory;
use crate::watch::{EventLog, EventType};
use pkg_constants::state::EVENT_LOG_CAPACITY;

/// One key of a [`StateStore::compare_and_put`] call.
#[derive(Debug, Clone)]
pub struct CasEntry {
    pub key: String,
    /// The bytes the key must currently hold (`None` = must not exist).
    pub expected: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Persistent state store backed by SlateDB.
///
/// Mutations of a key are serialized in-process, so a read-compare-write in
/// `compare_and_put` cannot interleave with another writer. Every mutation is
/// also published on `event_log` with the value it replaced.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    pub event_log: EventLog,
    key_locks: Arc<LockFactory>,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        Self::open(object_store).await
    }

    /// A throwaway store held entirely in memory.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::open(Arc::new(InMemory::new())).await
    }

    async fn open(object_store: Arc<dyn ObjectStore>) -> anyhow::Result<Self> {
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db,
            event_log: EventLog::new(EVENT_LOG_CAPACITY),
            key_locks: Arc::new(LockFactory::new()),
        })
    }

    /// Store a value under the given key.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let _guard = self.key_locks.acquire_ordered([key]).await;
        self.write_batch(&[(key.to_string(), value.to_vec())]).await
    }

    /// Write several keys atomically: either all land or none do.
    pub async fn put_batch(&self, entries: &[(String, Vec<u8>)]) -> anyhow::Result<()> {
        let _guard = self
            .key_locks
            .acquire_ordered(entries.iter().map(|(k, _)| k.clone()))
            .await;
        self.write_batch(entries).await
    }

    /// Atomically write every entry if each key still holds its expected
    /// bytes. Returns `false` (and writes nothing) on any mismatch.
    pub async fn compare_and_put(&self, entries: &[CasEntry]) -> anyhow::Result<bool> {
        let _guard = self
            .key_locks
            .acquire_ordered(entries.iter().map(|e| e.key.clone()))
            .await;
        for entry in entries {
            if self.get(&entry.key).await? != entry.expected {
                return Ok(false);
            }
        }
        let batch: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
        self.write_batch(&batch).await?;
        Ok(true)
    }

    /// Caller holds the key locks for every entry.
    async fn write_batch(&self, entries: &[(String, Vec<u8>)]) -> anyhow::Result<()> {
        let mut olds = Vec::with_capacity(entries.len());
        let mut batch = WriteBatch::new();
        for (key, value) in entries {
            olds.push(self.get(key).await?);
            batch.put(key.as_bytes(), value);
        }
        self.db
            .write(batch)
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB batch write failed: {}", e))?;
        for ((key, value), old) in entries.iter().zip(olds) {
            self.event_log
                .emit(EventType::Put, key.clone(), old, Some(value.clone()))
                .await;
        }
        Ok(())
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
        }
    }

    /// Delete a key from the store. Deleting a missing key is a no-op.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.key_locks.acquire_ordered([key]).await;
        let old = self.get(key).await?;
        if old.is_none() {
            return Ok(());
        }
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e))?;
        self.event_log
            .emit(EventType::Delete, key.to_string(), old, None)
            .await;
        Ok(())
    }

    /// List all key-value pairs whose keys start with `prefix`.
    /// Returns them as `(key_string, raw_bytes)`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

        loop {
            match iter.next().await {
                Ok(Some(kv)) => {
                    let key = String::from_utf8_lossy(&kv.key).to_string();
                    results.push((key, kv.value.to_vec()));
                }
                Ok(None) => break,
                Err(e) => return Err(anyhow::anyhow!("SlateDB scan failed: {}", e)),
            }
        }
        Ok(results)
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}
