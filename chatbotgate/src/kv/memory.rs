use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{KvError, KvResult};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    /// None means the entry never expires.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local store: a hash map under a read/write lock with a periodic
/// expiry sweep.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    map: RwLock<HashMap<String, Entry>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    pub fn new(sweep_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            map: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            sweeper: tokio::sync::Mutex::new(None),
        });

        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&inner), sweep_interval));
        // The store was just created; nothing can be racing on the slot.
        *inner.sweeper.try_lock().expect("fresh sweeper slot") = Some(sweeper);

        Self { inner }
    }

    fn check_open(&self) -> KvResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        self.check_open()?;
        let map = self.inner.map.read().expect("kv map lock poisoned");
        match map.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => Ok(entry.value.clone()),
            _ => Err(KvError::NotFound),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        self.check_open()?;
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        let entry = Entry {
            // Defensive copy: callers may keep mutating their buffer.
            value: value.to_vec(),
            expires_at,
        };
        let mut map = self.inner.map.write().expect("kv map lock poisoned");
        map.insert(key.to_string(), entry);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> KvResult<()> {
        self.check_open()?;
        let mut map = self.inner.map.write().expect("kv map lock poisoned");
        map.remove(key);
        Ok(())
    }

    pub async fn list(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.check_open()?;
        let now = Instant::now();
        let map = self.inner.map.read().expect("kv map lock poisoned");
        Ok(map
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && !entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Stop the sweeper, wait for it to exit, and drop all state.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let handle = self.inner.sweeper.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.map.write().expect("kv map lock poisoned").clear();
    }
}

async fn sweep_loop(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let mut map = inner.map.write().expect("kv map lock poisoned");
        map.retain(|_, entry| !entry.is_expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let store = MemoryStore::new(Duration::from_millis(20));
        store
            .set("gone", b"v", Duration::from_millis(10))
            .await
            .unwrap();
        store.set("stays", b"v", Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        // The sweep physically removed the expired entry.
        let map = store.inner.map.read().unwrap();
        assert!(!map.contains_key("gone"));
        assert!(map.contains_key("stays"));
    }

    #[tokio::test]
    async fn test_values_are_copied() {
        let store = MemoryStore::new(Duration::from_secs(300));
        let mut buf = b"original".to_vec();
        store.set("k", &buf, Duration::ZERO).await.unwrap();
        buf[0] = b'X';
        assert_eq!(store.get("k").await.unwrap(), b"original");
    }
}
