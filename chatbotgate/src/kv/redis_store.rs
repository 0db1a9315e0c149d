use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{KvError, KvResult};

/// Deadline for a single Redis round-trip; a slow store must not stall
/// request handling.
const OP_TIMEOUT: Duration = Duration::from_millis(100);

/// Connecting may legitimately take longer than a round-trip.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Networked store backed by Redis. TTLs are native (`SET ... PX`), listing
/// uses `SCAN MATCH`.
#[derive(Clone)]
pub struct RedisStore {
    inner: Arc<Inner>,
}

struct Inner {
    manager: ConnectionManager,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("closed", &self.inner.closed)
            .finish_non_exhaustive()
    }
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        KvError::Backend(e.to_string())
    }
}

/// Escape glob metacharacters so a literal key prefix cannot be widened
/// into a pattern.
fn escape_match_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
) -> KvResult<T> {
    match tokio::time::timeout(OP_TIMEOUT, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(KvError::Backend("redis operation timed out".to_string())),
    }
}

impl RedisStore {
    /// Connect and verify the server answers a `PING`.
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let connect = async {
            let mut manager = client.get_connection_manager().await?;
            let () = redis::cmd("PING").query_async(&mut manager).await?;
            Ok::<_, redis::RedisError>(manager)
        };
        let manager = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(result) => result?,
            Err(_) => return Err(KvError::Backend("redis connect timed out".to_string())),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                manager,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn check_open(&self) -> KvResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        self.check_open()?;
        let mut con = self.inner.manager.clone();
        let value: Option<Vec<u8>> = with_timeout(con.get(key)).await?;
        value.ok_or(KvError::NotFound)
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        self.check_open()?;
        let mut con = self.inner.manager.clone();
        if ttl.is_zero() {
            with_timeout(con.set(key, value)).await
        } else {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("PX").arg(ttl.as_millis() as u64);
            let () = with_timeout(cmd.query_async(&mut con)).await?;
            Ok(())
        }
    }

    pub async fn delete(&self, key: &str) -> KvResult<()> {
        self.check_open()?;
        let mut con = self.inner.manager.clone();
        with_timeout(con.del::<_, ()>(key)).await
    }

    pub async fn list(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.check_open()?;
        let mut con = self.inner.manager.clone();
        let pattern = format!("{}*", escape_match_pattern(prefix));
        // SCAN walks the keyspace cursor by cursor; a single overall
        // deadline bounds the whole walk.
        let walk = async {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(250)
                    .query_async(&mut con)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok::<_, redis::RedisError>(keys)
        };
        match tokio::time::timeout(OP_TIMEOUT.saturating_mul(5), walk).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::Backend("redis scan timed out".to_string())),
        }
    }

    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_match_pattern() {
        assert_eq!(escape_match_pattern("session:"), "session:");
        assert_eq!(escape_match_pattern("a*b?c[d]"), r"a\*b\?c\[d\]");
    }
}
