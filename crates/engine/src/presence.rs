//! Agent presence and liveness tracking
//!
//! A session is a TTL-bounded liveness record created at login, refreshed by
//! heartbeats, and deleted on logout or expiry. One user may hold several
//! concurrent sessions (multi-device). No live session means effective
//! status `offline`, regardless of the stored preference.
//!
//! The Redis backend keeps a reverse key per session (for heartbeat
//! validation), a ZSET of session ids per user scored by expiry, and a ZSET
//! of user ids per tenant scored by expiry. Expiry takes effect the moment
//! the score passes: no sweep is needed for `has_active_session` to turn
//! false.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chatwire_shared::{CoreError, CoreResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait Presence: Send + Sync {
    /// Create a new liveness record and return its session id.
    async fn create_session(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<Uuid>;

    /// Extend a session's TTL. Returns `false` if the session no longer
    /// exists; the caller must create a new one.
    async fn heartbeat(&self, session_id: Uuid, user_id: Uuid) -> CoreResult<bool>;

    /// Delete a session unconditionally. Idempotent.
    async fn logout(&self, session_id: Uuid, user_id: Uuid) -> CoreResult<()>;

    /// Whether the user holds any session with `expires_at > now`.
    async fn has_active_session(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<bool>;

    /// Users of the tenant with at least one live session.
    async fn online_users(&self, tenant_id: Uuid) -> CoreResult<Vec<Uuid>>;
}

fn now_unix() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

// =============================================================================
// Redis backend
// =============================================================================

pub struct RedisPresence {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisPresence {
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    fn sess_key(session_id: Uuid) -> String {
        format!("presence:sess:{session_id}")
    }

    fn user_key(tenant_id: Uuid, user_id: Uuid) -> String {
        format!("presence:user:{tenant_id}:{user_id}")
    }

    fn tenant_key(tenant_id: Uuid) -> String {
        format!("presence:online:{tenant_id}")
    }

    async fn touch(
        &self,
        conn: &mut ConnectionManager,
        tenant_id: Uuid,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<(), redis::RedisError> {
        let expires = now_unix() + self.ttl.as_secs_f64();
        let ttl_secs = self.ttl.as_secs().max(1);

        let _: () = conn
            .set_ex(
                Self::sess_key(session_id),
                format!("{tenant_id}:{user_id}"),
                ttl_secs,
            )
            .await?;
        let _: () = conn
            .zadd(Self::user_key(tenant_id, user_id), session_id.to_string(), expires)
            .await?;
        // Keep the per-user index from outliving its sessions forever
        let _: () = conn
            .expire(Self::user_key(tenant_id, user_id), (ttl_secs * 4) as i64)
            .await?;
        let _: () = conn
            .zadd(Self::tenant_key(tenant_id), user_id.to_string(), expires)
            .await?;
        Ok(())
    }
}

fn redis_err(e: redis::RedisError) -> CoreError {
    CoreError::Presence(e.to_string())
}

#[async_trait]
impl Presence for RedisPresence {
    async fn create_session(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<Uuid> {
        let session_id = Uuid::new_v4();
        let mut conn = self.conn.clone();
        self.touch(&mut conn, tenant_id, user_id, session_id)
            .await
            .map_err(redis_err)?;
        tracing::debug!(session_id = %session_id, user_id = %user_id, "Presence session created");
        Ok(session_id)
    }

    async fn heartbeat(&self, session_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(Self::sess_key(session_id))
            .await
            .map_err(redis_err)?;
        let Some(value) = value else {
            return Ok(false);
        };
        let Some((tenant_str, user_str)) = value.split_once(':') else {
            return Ok(false);
        };
        if user_str != user_id.to_string() {
            // Session belongs to someone else
            return Ok(false);
        }
        let tenant_id = Uuid::parse_str(tenant_str)
            .map_err(|e| CoreError::Presence(format!("bad session record: {e}")))?;

        self.touch(&mut conn, tenant_id, user_id, session_id)
            .await
            .map_err(redis_err)?;
        // Drop session ids whose score already passed
        let _: () = conn
            .zrembyscore(Self::user_key(tenant_id, user_id), "-inf", now_unix())
            .await
            .map_err(redis_err)?;
        Ok(true)
    }

    async fn logout(&self, session_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(Self::sess_key(session_id))
            .await
            .map_err(redis_err)?;
        let _: () = conn.del(Self::sess_key(session_id)).await.map_err(redis_err)?;
        if let Some(value) = value {
            if let Some((tenant_str, _)) = value.split_once(':') {
                if let Ok(tenant_id) = Uuid::parse_str(tenant_str) {
                    let _: () = conn
                        .zrem(Self::user_key(tenant_id, user_id), session_id.to_string())
                        .await
                        .map_err(redis_err)?;
                }
            }
        }
        Ok(())
    }

    async fn has_active_session(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let live: i64 = conn
            .zcount(
                Self::user_key(tenant_id, user_id),
                format!("({}", now_unix()),
                "+inf",
            )
            .await
            .map_err(redis_err)?;
        Ok(live > 0)
    }

    async fn online_users(&self, tenant_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        // The tenant index can overstate briefly after a logout, so each
        // candidate is confirmed against its per-user sessions.
        let members: Vec<String> = conn
            .zrangebyscore(
                Self::tenant_key(tenant_id),
                format!("({}", now_unix()),
                "+inf",
            )
            .await
            .map_err(redis_err)?;

        let mut online = Vec::with_capacity(members.len());
        for member in members {
            let Ok(user_id) = Uuid::parse_str(&member) else {
                continue;
            };
            if self.has_active_session(tenant_id, user_id).await? {
                online.push(user_id);
            }
        }
        Ok(online)
    }
}

impl crate::Engine {
    /// Presentation status for one staff member: stored preference gated by
    /// liveness, with `busy` derived from remaining capacity.
    pub async fn effective_status(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<chatwire_shared::EffectiveStatus> {
        let profile = self.store.agent_profile(tenant_id, user_id).await?;
        let stored = profile
            .as_ref()
            .map(|p| p.status)
            .unwrap_or(chatwire_shared::AgentStatus::Offline);
        let live = self.presence.has_active_session(tenant_id, user_id).await?;
        let remaining = match &profile {
            Some(p) => {
                let active = self.store.active_assigned_count(tenant_id, user_id).await?;
                (p.max_concurrent as i64 - active).max(0)
            }
            None => 0,
        };
        Ok(chatwire_shared::EffectiveStatus::derive(
            stored, live, remaining,
        ))
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

struct SessionRecord {
    tenant_id: Uuid,
    user_id: Uuid,
    expires_at: OffsetDateTime,
}

/// Presence over process memory. Backs the engine test suite and
/// single-instance deployments without Redis.
pub struct MemoryPresence {
    sessions: Mutex<HashMap<Uuid, SessionRecord>>,
    ttl: Duration,
}

impl MemoryPresence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl Presence for MemoryPresence {
    async fn create_session(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<Uuid> {
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session_id,
            SessionRecord {
                tenant_id,
                user_id,
                expires_at: OffsetDateTime::now_utc() + self.ttl,
            },
        );
        Ok(session_id)
    }

    async fn heartbeat(&self, session_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        let mut sessions = self.sessions.lock().await;
        let now = OffsetDateTime::now_utc();
        match sessions.get_mut(&session_id) {
            Some(record) if record.user_id == user_id && record.expires_at > now => {
                record.expires_at = now + self.ttl;
                Ok(true)
            }
            Some(_) | None => {
                sessions.retain(|_, r| r.expires_at > now);
                Ok(false)
            }
        }
    }

    async fn logout(&self, session_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(&session_id)
            .is_some_and(|r| r.user_id == user_id)
        {
            sessions.remove(&session_id);
        }
        Ok(())
    }

    async fn has_active_session(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<bool> {
        let sessions = self.sessions.lock().await;
        let now = OffsetDateTime::now_utc();
        Ok(sessions.values().any(|r| {
            r.tenant_id == tenant_id && r.user_id == user_id && r.expires_at > now
        }))
    }

    async fn online_users(&self, tenant_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let sessions = self.sessions.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut users: Vec<Uuid> = sessions
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.expires_at > now)
            .map(|r| r.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let presence = MemoryPresence::new(Duration::from_secs(45));
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(!presence.has_active_session(tenant, user).await.unwrap());

        let session = presence.create_session(tenant, user).await.unwrap();
        assert!(presence.has_active_session(tenant, user).await.unwrap());
        assert!(presence.heartbeat(session, user).await.unwrap());

        presence.logout(session, user).await.unwrap();
        assert!(!presence.has_active_session(tenant, user).await.unwrap());
        // Heartbeat after logout reports a missing session
        assert!(!presence.heartbeat(session, user).await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_without_heartbeat_or_logout() {
        let presence = MemoryPresence::new(Duration::from_millis(20));
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        presence.create_session(tenant, user).await.unwrap();
        assert!(presence.has_active_session(tenant, user).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!presence.has_active_session(tenant, user).await.unwrap());
        assert!(presence.online_users(tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multi_device_sessions() {
        let presence = MemoryPresence::new(Duration::from_secs(45));
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let s1 = presence.create_session(tenant, user).await.unwrap();
        let _s2 = presence.create_session(tenant, user).await.unwrap();

        // Logging out one device keeps the user online
        presence.logout(s1, user).await.unwrap();
        assert!(presence.has_active_session(tenant, user).await.unwrap());
        assert_eq!(presence.online_users(tenant).await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_wrong_user() {
        let presence = MemoryPresence::new(Duration::from_secs(45));
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let session = presence.create_session(tenant, user).await.unwrap();
        assert!(!presence.heartbeat(session, Uuid::new_v4()).await.unwrap());
        // The rightful owner is unaffected
        assert!(presence.heartbeat(session, user).await.unwrap());
    }

    #[tokio::test]
    async fn test_online_users_scoped_by_tenant() {
        let presence = MemoryPresence::new(Duration::from_secs(45));
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let user = Uuid::new_v4();

        presence.create_session(t1, user).await.unwrap();
        assert_eq!(presence.online_users(t1).await.unwrap(), vec![user]);
        assert!(presence.online_users(t2).await.unwrap().is_empty());
        assert!(!presence.has_active_session(t2, user).await.unwrap());
    }
}
