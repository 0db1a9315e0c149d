//!
//! The key-value substrate backing sessions, email tokens, OTP indexes and
//! rate-limit buckets.
//!
//! Every store handle is scoped by a namespace prefix that is transparent
//! to callers: keys are stored as `<namespace>:<key>` and `list` returns
//! logical keys with the prefix stripped.
//!

mod disk;
mod memory;
mod redis_store;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors returned by key-value store operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The key does not exist (or has expired).
    #[error("key not found")]
    NotFound,
    /// The store has been closed; no further operations are possible.
    #[error("store is closed")]
    Closed,
    /// The backend failed (I/O, network, serialization).
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Backend selection, deserialized from the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KvBackendConfig {
    /// Process-local hash map. State is lost on restart.
    #[default]
    Memory,
    /// Embedded LMDB database under `path`.
    Disk {
        path: std::path::PathBuf,
    },
    /// Networked Redis instance.
    Redis {
        url: String,
    },
}

/// A namespaced handle onto one of the store backends.
///
/// Handles are cheap to clone; all clones share the underlying engine and
/// its background sweeper. `close` affects every handle of the same engine.
#[derive(Debug, Clone)]
pub struct KvStore {
    backend: Backend,
    namespace: String,
}

#[derive(Debug, Clone)]
enum Backend {
    Memory(MemoryStore),
    Disk(DiskStore),
    Redis(RedisStore),
}

impl KvStore {
    /// Build a store engine from its config and wrap it under `namespace`,
    /// sweeping with the default interval.
    pub async fn open(config: &KvBackendConfig, namespace: &str) -> KvResult<Self> {
        Self::open_with_sweep(config, crate::constants::DEFAULT_SWEEP_INTERVAL, namespace).await
    }

    /// As [`KvStore::open`] with an explicit expiry-sweep interval. The
    /// Redis backend expires natively and ignores it.
    pub async fn open_with_sweep(
        config: &KvBackendConfig,
        sweep_interval: Duration,
        namespace: &str,
    ) -> KvResult<Self> {
        let backend = match config {
            KvBackendConfig::Memory => Backend::Memory(MemoryStore::new(sweep_interval)),
            KvBackendConfig::Disk { path } => {
                Backend::Disk(DiskStore::open(path, sweep_interval)?)
            }
            KvBackendConfig::Redis { url } => Backend::Redis(RedisStore::connect(url).await?),
        };
        Ok(Self {
            backend,
            namespace: namespace.to_string(),
        })
    }

    /// Derive a handle with a different namespace over the same engine.
    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self {
            backend: self.backend.clone(),
            namespace: namespace.to_string(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn scoped_prefix(&self, prefix: &str) -> String {
        format!("{}:{}", self.namespace, prefix)
    }

    pub async fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        let key = self.scoped(key);
        match &self.backend {
            Backend::Memory(s) => s.get(&key).await,
            Backend::Disk(s) => s.get(&key).await,
            Backend::Redis(s) => s.get(&key).await,
        }
    }

    /// Store `value` under `key`. A zero `ttl` means the entry never expires.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        let key = self.scoped(key);
        match &self.backend {
            Backend::Memory(s) => s.set(&key, value, ttl).await,
            Backend::Disk(s) => s.set(&key, value, ttl).await,
            Backend::Redis(s) => s.set(&key, value, ttl).await,
        }
    }

    /// Delete `key`. Deleting a non-existent key is not an error.
    pub async fn delete(&self, key: &str) -> KvResult<()> {
        let key = self.scoped(key);
        match &self.backend {
            Backend::Memory(s) => s.delete(&key).await,
            Backend::Disk(s) => s.delete(&key).await,
            Backend::Redis(s) => s.delete(&key).await,
        }
    }

    pub async fn exists(&self, key: &str) -> KvResult<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(KvError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List logical keys starting with `prefix`, namespace stripped.
    pub async fn list(&self, prefix: &str) -> KvResult<Vec<String>> {
        let scoped = self.scoped_prefix(prefix);
        let keys = match &self.backend {
            Backend::Memory(s) => s.list(&scoped).await?,
            Backend::Disk(s) => s.list(&scoped).await?,
            Backend::Redis(s) => s.list(&scoped).await?,
        };
        let ns_prefix = format!("{}:", self.namespace);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&ns_prefix).map(|s| s.to_string()))
            .collect())
    }

    pub async fn count(&self, prefix: &str) -> KvResult<usize> {
        Ok(self.list(prefix).await?.len())
    }

    /// Stop the background sweeper and release the engine. Idempotent;
    /// subsequent operations fail with [`KvError::Closed`].
    pub async fn close(&self) {
        match &self.backend {
            Backend::Memory(s) => s.close().await,
            Backend::Disk(s) => s.close().await,
            Backend::Redis(s) => s.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: KvStore) {
        store.set("a", b"one", Duration::ZERO).await.unwrap();
        store.set("ab", b"two", Duration::ZERO).await.unwrap();
        store.set("b", b"three", Duration::ZERO).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), b"one");
        assert!(store.exists("ab").await.unwrap());
        assert!(!store.exists("missing").await.unwrap());

        let mut keys = store.list("a").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "ab".to_string()]);
        assert_eq!(store.count("").await.unwrap(), 3);

        store.delete("a").await.unwrap();
        assert!(matches!(store.get("a").await, Err(KvError::NotFound)));
        // Deleting again is fine.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = KvStore::open(&KvBackendConfig::Memory, "test").await.unwrap();
        exercise_store(store).await;
    }

    #[tokio::test]
    async fn test_disk_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(
            &KvBackendConfig::Disk {
                path: dir.path().to_path_buf(),
            },
            "test",
        )
        .await
        .unwrap();
        exercise_store(store).await;
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let sessions = KvStore::open(&KvBackendConfig::Memory, "session").await.unwrap();
        let tokens = sessions.with_namespace("email_token");

        sessions.set("k", b"s", Duration::ZERO).await.unwrap();
        tokens.set("k", b"t", Duration::ZERO).await.unwrap();

        assert_eq!(sessions.get("k").await.unwrap(), b"s");
        assert_eq!(tokens.get("k").await.unwrap(), b"t");
        assert_eq!(sessions.list("").await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = KvStore::open(&KvBackendConfig::Memory, "ttl").await.unwrap();
        store
            .set("short", b"v", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.exists("short").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(store.get("short").await, Err(KvError::NotFound)));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = KvStore::open(&KvBackendConfig::Memory, "closed").await.unwrap();
        store.set("k", b"v", Duration::ZERO).await.unwrap();
        store.close().await;
        assert!(matches!(store.get("k").await, Err(KvError::Closed)));
        assert!(matches!(
            store.set("k", b"v", Duration::ZERO).await,
            Err(KvError::Closed)
        ));
        // Close is idempotent.
        store.close().await;
    }
}
