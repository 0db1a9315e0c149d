//!
//! Per-key token buckets persisted in the KV store.
//!
//! Used to throttle login-link emails per recipient. The limiter fails
//! open: a broken or slow store must never lock users out of logging in,
//! so admission errs on the permissive side and logs loudly instead.
//!

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::KV_OP_TIMEOUT;
use crate::kv::{KvError, KvStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    tokens: u32,
    last_refill: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    kv: KvStore,
    capacity: u32,
    interval: Duration,
}

impl RateLimiter {
    pub fn new(kv: KvStore, capacity: u32, interval: Duration) -> Self {
        Self {
            kv,
            capacity: capacity.max(1),
            interval,
        }
    }

    /// Buckets vanish on their own after sitting idle long enough to have
    /// fully refilled several times over.
    fn bucket_ttl(&self) -> Duration {
        self.interval.saturating_mul(4).max(Duration::from_secs(60))
    }

    /// Take one token for `key`. Returns `false` only when the bucket is
    /// provably empty; store failures admit the request.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut bucket = match self.load(key).await {
            Ok(Some(bucket)) => bucket,
            Ok(None) => {
                let bucket = Bucket {
                    tokens: self.capacity - 1,
                    last_refill: now,
                };
                self.persist_fail_open(key, &bucket).await;
                return true;
            }
            Err(error) => {
                tracing::warn!(%key, %error, "rate limiter failing open on load");
                return true;
            }
        };

        // Lazy refill: credit whole elapsed intervals only.
        if let Ok(interval) = chrono::Duration::from_std(self.interval) {
            if interval > chrono::Duration::zero() {
                let elapsed = now - bucket.last_refill;
                let intervals = elapsed.num_milliseconds() / interval.num_milliseconds().max(1);
                if intervals >= 1 {
                    bucket.tokens = self.capacity;
                    bucket.last_refill += interval * intervals.min(i32::MAX as i64) as i32;
                }
            }
        }

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        self.persist_fail_open(key, &bucket).await;
        true
    }

    /// Forget the bucket for `key`.
    pub async fn reset(&self, key: &str) {
        match tokio::time::timeout(KV_OP_TIMEOUT, self.kv.delete(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::debug!(%key, %error, "rate limiter reset failed"),
            Err(_) => tracing::debug!(%key, "rate limiter reset deadline exceeded"),
        }
    }

    /// Drop buckets that have been idle longer than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, KvError> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut dropped = 0;
        for key in self.kv.list("").await? {
            let Ok(bytes) = self.kv.get(&key).await else {
                continue;
            };
            let stale = match serde_json::from_slice::<Bucket>(&bytes) {
                Ok(bucket) => now - bucket.last_refill > max_age,
                // Whatever it is, it is not a bucket.
                Err(_) => true,
            };
            if stale {
                self.kv.delete(&key).await?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    async fn load(&self, key: &str) -> Result<Option<Bucket>, KvError> {
        let bytes = match tokio::time::timeout(KV_OP_TIMEOUT, self.kv.get(key)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(KvError::NotFound)) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(KvError::Backend("kv get deadline exceeded".to_string())),
        };
        match serde_json::from_slice(&bytes) {
            Ok(bucket) => Ok(Some(bucket)),
            Err(_) => Ok(None),
        }
    }

    async fn persist_fail_open(&self, key: &str, bucket: &Bucket) {
        let bytes = match serde_json::to_vec(bucket) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%key, %error, "rate limiter failing open on encode");
                return;
            }
        };
        let write = tokio::time::timeout(
            KV_OP_TIMEOUT,
            self.kv.set(key, &bytes, self.bucket_ttl()),
        )
        .await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(%key, %error, "rate limiter failing open on persist")
            }
            Err(_) => tracing::warn!(%key, "rate limiter failing open on persist deadline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvBackendConfig;

    async fn limiter(capacity: u32, interval: Duration) -> RateLimiter {
        let kv = KvStore::open(&KvBackendConfig::Memory, "ratelimit").await.unwrap();
        RateLimiter::new(kv, capacity, interval)
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let limiter = limiter(3, Duration::from_secs(3600)).await;
        for _ in 0..3 {
            assert!(limiter.allow("bob@example.com").await);
        }
        assert!(!limiter.allow("bob@example.com").await);
        // Other keys are unaffected.
        assert!(limiter.allow("carol@example.com").await);
    }

    #[tokio::test]
    async fn test_refill_after_interval() {
        let limiter = limiter(2, Duration::from_millis(40)).await;
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_reset_restores_capacity() {
        let limiter = limiter(1, Duration::from_secs(3600)).await;
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
        limiter.reset("k").await;
        assert!(limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_closed() {
        let kv = KvStore::open(&KvBackendConfig::Memory, "ratelimit").await.unwrap();
        let limiter = RateLimiter::new(kv.clone(), 1, Duration::from_secs(3600));
        kv.close().await;
        // Every call admits: the store is unusable.
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_buckets() {
        let kv = KvStore::open(&KvBackendConfig::Memory, "ratelimit").await.unwrap();
        let limiter = RateLimiter::new(kv.clone(), 5, Duration::from_secs(3600));
        assert!(limiter.allow("idle").await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let dropped = limiter.cleanup(Duration::from_millis(10)).await.unwrap();
        assert_eq!(dropped, 1);
        assert!(kv.list("").await.unwrap().is_empty());
    }
}
