//! Non-blocking named mutexes
//!
//! Key-scoped locks used to avoid duplicate scheduler work across process
//! instances and to serialize fairness-cursor decisions. `Busy` and
//! `Unavailable` are distinct outcomes: callers skip on `Busy` and proceed
//! unprotected on `Unavailable` (correctness degrades to "assume single
//! instance", not to an outage).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome of a non-blocking lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// Lock acquired; the token must be passed back to `unlock`.
    Acquired(String),
    /// Someone else holds the lock.
    Busy,
    /// The lock backend itself failed.
    Unavailable,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn try_lock(&self, key: &str, ttl: Duration) -> LockAttempt;
    async fn unlock(&self, key: &str, token: &str);
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis-backed named mutex: `SET key token NX PX ttl`, released by a
/// compare-and-delete script so a lock that outlived its TTL is never
/// released by a stale holder.
pub struct RedisLock {
    conn: ConnectionManager,
}

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(key: &str) -> String {
        format!("lock:{key}")
    }
}

#[async_trait]
impl LockManager for RedisLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> LockAttempt {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let result: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(Self::key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => LockAttempt::Acquired(token),
            Ok(None) => LockAttempt::Busy,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Lock backend unavailable");
                LockAttempt::Unavailable
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(UNLOCK_SCRIPT);
        let result: Result<i32, redis::RedisError> = script
            .key(Self::key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "Failed to release lock");
        }
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Single-process lock table. Used by tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, String>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLock {
    async fn try_lock(&self, key: &str, _ttl: Duration) -> LockAttempt {
        let mut held = self.held.lock().await;
        if held.contains_key(key) {
            return LockAttempt::Busy;
        }
        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), token.clone());
        LockAttempt::Acquired(token)
    }

    async fn unlock(&self, key: &str, token: &str) {
        let mut held = self.held.lock().await;
        if held.get(key).map(String::as_str) == Some(token) {
            held.remove(key);
        }
    }
}

/// Lock backend that always reports `Unavailable`. Exercises the
/// proceed-unprotected degradation path in tests.
pub struct UnavailableLock;

#[async_trait]
impl LockManager for UnavailableLock {
    async fn try_lock(&self, _key: &str, _ttl: Duration) -> LockAttempt {
        LockAttempt::Unavailable
    }

    async fn unlock(&self, _key: &str, _token: &str) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_mutual_exclusion() {
        let locks = MemoryLock::new();
        let ttl = Duration::from_secs(5);

        let first = locks.try_lock("job:drain:t1", ttl).await;
        let token = match first {
            LockAttempt::Acquired(t) => t,
            other => panic!("expected Acquired, got {:?}", other),
        };

        assert_eq!(locks.try_lock("job:drain:t1", ttl).await, LockAttempt::Busy);
        // A different key is independent
        assert!(matches!(
            locks.try_lock("job:drain:t2", ttl).await,
            LockAttempt::Acquired(_)
        ));

        locks.unlock("job:drain:t1", &token).await;
        assert!(matches!(
            locks.try_lock("job:drain:t1", ttl).await,
            LockAttempt::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_token() {
        let locks = MemoryLock::new();
        let ttl = Duration::from_secs(5);

        let LockAttempt::Acquired(_token) = locks.try_lock("k", ttl).await else {
            panic!("expected Acquired");
        };
        // Wrong token must not release the lock
        locks.unlock("k", "not-the-token").await;
        assert_eq!(locks.try_lock("k", ttl).await, LockAttempt::Busy);
    }
}
