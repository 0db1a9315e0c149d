use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{KvError, KvResult};

// Virtual address space reservation, not disk usage.
const MAP_SIZE: usize = 10 * 1024 * 1024 * 1024;

/// How many expired keys a single sweep transaction may delete.
const SWEEP_BATCH: usize = 512;

/// Embedded on-disk store over LMDB.
///
/// Every stored value is prefixed with an 8-byte big-endian unix-nanosecond
/// expiry instant (0 = no expiry). Reads treat expired entries as absent and
/// schedule their deletion; a periodic sweep batch-deletes the rest.
#[derive(Debug, Clone)]
pub struct DiskStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    env: Env,
    db: Database<Str, Bytes>,
    closed: AtomicBool,
    cancel: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

fn now_nanos() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX) as u64
}

fn encode_value(value: &[u8], ttl: Duration) -> Vec<u8> {
    let expires_at = if ttl.is_zero() {
        0u64
    } else {
        now_nanos().saturating_add(ttl.as_nanos().min(u64::MAX as u128) as u64)
    };
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expires_at.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Returns `(expires_at, payload)`; `None` for values too short to carry
/// the expiry header.
fn decode_value(raw: &[u8]) -> Option<(u64, &[u8])> {
    if raw.len() < 8 {
        return None;
    }
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&raw[..8]);
    Some((u64::from_be_bytes(stamp), &raw[8..]))
}

fn is_expired(expires_at: u64, now: u64) -> bool {
    expires_at != 0 && now >= expires_at
}

impl DiskStore {
    /// Open (or create) the database under `path`.
    ///
    /// A failure to open is retried once after moving the corrupt directory
    /// aside, so a damaged store never prevents startup.
    pub fn open(path: &Path, sweep_interval: Duration) -> KvResult<Self> {
        match Self::open_env(path) {
            Ok(store) => Ok(Self::start(store, sweep_interval)),
            Err(first) => {
                tracing::warn!(path = %path.display(), error = %first, "disk store failed to open, attempting recovery");
                let quarantine = path.with_extension(format!("corrupt-{}", now_nanos()));
                std::fs::rename(path, &quarantine)
                    .map_err(|e| KvError::Backend(format!("quarantine rename failed: {e}")))?;
                tracing::warn!(quarantine = %quarantine.display(), "corrupt store moved aside");
                let store = Self::open_env(path)?;
                Ok(Self::start(store, sweep_interval))
            }
        }
    }

    fn open_env(path: &Path) -> KvResult<Inner> {
        std::fs::create_dir_all(path).map_err(|e| KvError::Backend(e.to_string()))?;

        // Safety: opening LMDB is unsafe because a broken lock file can
        // cause UB. The recovery pass above quarantines such directories.
        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(1)
                .map_size(MAP_SIZE)
                .open(path)
        }
        .map_err(|e| KvError::Backend(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(|e| KvError::Backend(e.to_string()))?;
        let db = env
            .create_database(&mut wtxn, None)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        wtxn.commit().map_err(|e| KvError::Backend(e.to_string()))?;

        Ok(Inner {
            env,
            db,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            sweeper: tokio::sync::Mutex::new(None),
        })
    }

    fn start(inner: Inner, sweep_interval: Duration) -> Self {
        let inner = Arc::new(inner);
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&inner), sweep_interval));
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
        let inner = &self.inner;
        let rtxn = inner.env.read_txn().map_err(|e| KvError::Backend(e.to_string()))?;
        let raw = inner
            .db
            .get(&rtxn, key)
            .map_err(|e| KvError::Backend(e.to_string()))?
            .ok_or(KvError::NotFound)?;
        let (expires_at, payload) = decode_value(raw).ok_or(KvError::NotFound)?;
        if is_expired(expires_at, now_nanos()) {
            let payload_discarded = payload.len();
            drop(rtxn);
            tracing::trace!(key, payload_discarded, "lazy-expiring disk entry");
            self.schedule_delete(key.to_string());
            return Err(KvError::NotFound);
        }
        Ok(payload.to_vec())
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        self.check_open()?;
        let buf = encode_value(value, ttl);
        let mut wtxn = self
            .inner
            .env
            .write_txn()
            .map_err(|e| KvError::Backend(e.to_string()))?;
        self.inner
            .db
            .put(&mut wtxn, key, &buf)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        wtxn.commit().map_err(|e| KvError::Backend(e.to_string()))
    }

    pub async fn delete(&self, key: &str) -> KvResult<()> {
        self.check_open()?;
        let mut wtxn = self
            .inner
            .env
            .write_txn()
            .map_err(|e| KvError::Backend(e.to_string()))?;
        self.inner
            .db
            .delete(&mut wtxn, key)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        wtxn.commit().map_err(|e| KvError::Backend(e.to_string()))
    }

    pub async fn list(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.check_open()?;
        let now = now_nanos();
        let rtxn = self
            .inner
            .env
            .read_txn()
            .map_err(|e| KvError::Backend(e.to_string()))?;
        let iter = self
            .inner
            .db
            .prefix_iter(&rtxn, prefix)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        let mut keys = Vec::new();
        for item in iter {
            let (key, raw) = item.map_err(|e| KvError::Backend(e.to_string()))?;
            match decode_value(raw) {
                Some((expires_at, _)) if !is_expired(expires_at, now) => {
                    keys.push(key.to_string());
                }
                _ => {}
            }
        }
        Ok(keys)
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let handle = self.inner.sweeper.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Deletion of a lazily-discovered expired entry happens off the read
    /// path. The expiry is re-checked inside the write transaction.
    fn schedule_delete(&self, key: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            let result = (|| -> Result<(), heed::Error> {
                let mut wtxn = inner.env.write_txn()?;
                if let Some(raw) = inner.db.get(&wtxn, &key)? {
                    if matches!(decode_value(raw), Some((at, _)) if is_expired(at, now_nanos())) {
                        inner.db.delete(&mut wtxn, &key)?;
                    }
                }
                wtxn.commit()
            })();
            if let Err(error) = result {
                tracing::debug!(%key, %error, "async expiry delete failed");
            }
        });
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
        if let Err(error) = sweep_once(&inner) {
            tracing::warn!(%error, "disk store sweep failed");
        }
    }
}

fn sweep_once(inner: &Inner) -> Result<(), heed::Error> {
    loop {
        let now = now_nanos();
        let expired: Vec<String> = {
            let rtxn = inner.env.read_txn()?;
            let iter = inner.db.iter(&rtxn)?;
            let mut batch = Vec::new();
            for item in iter {
                let (key, raw) = item?;
                match decode_value(raw) {
                    Some((at, _)) if is_expired(at, now) => batch.push(key.to_string()),
                    // Entries without a valid header are junk; drop them too.
                    None => batch.push(key.to_string()),
                    _ => {}
                }
                if batch.len() >= SWEEP_BATCH {
                    break;
                }
            }
            batch
        };
        if expired.is_empty() {
            return Ok(());
        }
        let full_batch = expired.len() >= SWEEP_BATCH;
        let mut wtxn = inner.env.write_txn()?;
        for key in &expired {
            inner.db.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        tracing::debug!(deleted = expired.len(), "disk store sweep batch");
        if !full_batch {
            return Ok(());
        }
    }
}
