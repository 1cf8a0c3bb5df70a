//! Capacity-aware conversation assignment
//!
//! Routing pools are resolved per conversation: a targeted, enabled skill
//! group with members routes within that group, anything else falls back to
//! the tenant-wide staff pool. Selection is pluggable per pool through
//! [`StrategyRegistry`]; the stock strategy is weighted round-robin with a
//! persisted fairness cursor.
//!
//! The cursor is advanced under a named mutex so concurrent assigners on
//! different instances do not hand consecutive conversations to the same
//! agent. Losing the mutex is not fatal: fairness degrades, correctness does
//! not, because the capacity guard lives inside the store's conditional
//! assign.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatwire_shared::{
    AgentStatus, Candidate, Claims, Conversation, ConversationStatus, CoreError, CoreResult,
    EventKind, DEFAULT_GROUP_KEY,
};
use serde_json::json;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::lock::LockAttempt;
use crate::{AssignPolicy, Engine};

const CURSOR_LOCK_TTL: Duration = Duration::from_secs(5);

/// Upper bound on queued rows scanned when backfilling a single agent.
const MAX_BACKFILL_SCAN: i64 = 200;

// =============================================================================
// Selection strategies
// =============================================================================

/// Inputs to a selection decision. Candidates are already filtered to agents
/// who are stored-online and have a live session.
pub struct SelectionContext<'a> {
    pub tenant_id: Uuid,
    pub group_key: &'a str,
    /// Last agent the pool's cursor points at, if any.
    pub cursor: Option<Uuid>,
    pub candidates: &'a [Candidate],
}

/// Picks the next agent for a conversation, or `None` if nobody in the pool
/// can take it.
pub trait SelectStrategy: Send + Sync {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<Uuid>;
}

/// Weighted round-robin: the ring is ordered by weight descending, then
/// user id ascending for a stable tiebreak. Selection starts strictly after
/// the cursor, wraps around, and skips agents with no remaining capacity.
pub struct RoundRobin;

impl SelectStrategy for RoundRobin {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<Uuid> {
        let mut ring: Vec<&Candidate> = ctx.candidates.iter().collect();
        ring.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.user_id.cmp(&b.user_id)));
        if ring.is_empty() {
            return None;
        }

        // Start one past the cursor; a cursor pointing at an agent who left
        // the pool degrades to starting from the top.
        let start = ctx
            .cursor
            .and_then(|last| ring.iter().position(|c| c.user_id == last))
            .map(|i| i + 1)
            .unwrap_or(0);

        (0..ring.len())
            .map(|offset| ring[(start + offset) % ring.len()])
            .find(|c| c.remaining_capacity() > 0)
            .map(|c| c.user_id)
    }
}

/// Per-pool strategy lookup: exact `(tenant, group_key)` entry, then a
/// tenant-wide entry, then the default.
pub struct StrategyRegistry {
    default: Arc<dyn SelectStrategy>,
    by_pool: HashMap<(Uuid, String), Arc<dyn SelectStrategy>>,
    by_tenant: HashMap<Uuid, Arc<dyn SelectStrategy>>,
}

impl StrategyRegistry {
    pub fn new(default: Arc<dyn SelectStrategy>) -> Self {
        Self {
            default,
            by_pool: HashMap::new(),
            by_tenant: HashMap::new(),
        }
    }

    pub fn with_pool(
        mut self,
        tenant_id: Uuid,
        group_key: impl Into<String>,
        strategy: Arc<dyn SelectStrategy>,
    ) -> Self {
        self.by_pool.insert((tenant_id, group_key.into()), strategy);
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid, strategy: Arc<dyn SelectStrategy>) -> Self {
        self.by_tenant.insert(tenant_id, strategy);
        self
    }

    pub fn resolve(&self, tenant_id: Uuid, group_key: &str) -> &Arc<dyn SelectStrategy> {
        self.by_pool
            .get(&(tenant_id, group_key.to_string()))
            .or_else(|| self.by_tenant.get(&tenant_id))
            .unwrap_or(&self.default)
    }
}

// =============================================================================
// Engine operations
// =============================================================================

impl Engine {
    /// Automatically place a queued conversation with an online agent.
    ///
    /// Returns the chosen agent, or `None` when the conversation is not
    /// queued anymore or nobody in the pool can take it. `exclude` drops one
    /// agent from consideration (used by the no-reply transfer).
    pub async fn auto_assign(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        exclude: Option<Uuid>,
    ) -> CoreResult<Option<Uuid>> {
        let Some(conversation) = self.store.conversation(tenant_id, conversation_id).await? else {
            return Ok(None);
        };
        if conversation.status != ConversationStatus::Queued {
            return Ok(None);
        }

        let (group_key, mut candidates) = self.resolve_live_pool(&conversation, exclude).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let lock_key = format!("cursor:{tenant_id}:{group_key}");
        let guard = self.acquire_cursor_lock(&lock_key).await;

        let strategy = self.strategies.resolve(tenant_id, &group_key);
        let cursor = self.store.cursor_last(tenant_id, &group_key).await?;

        let mut assigned = None;
        // A CAS loss (capacity race, another assigner) drops the candidate
        // and retries selection against the rest of the ring.
        while !candidates.is_empty() {
            let ctx = SelectionContext {
                tenant_id,
                group_key: &group_key,
                cursor,
                candidates: &candidates,
            };
            let Some(pick) = strategy.select(&ctx) else {
                break;
            };
            if self
                .store
                .assign_if_unassigned(tenant_id, conversation_id, pick)
                .await?
            {
                self.store.cursor_set(tenant_id, &group_key, pick).await?;
                assigned = Some(pick);
                break;
            }
            candidates.retain(|c| c.user_id != pick);
        }

        if let Some(token) = guard {
            self.locks.unlock(&lock_key, &token).await;
        }

        if let Some(agent) = assigned {
            self.emit(
                tenant_id,
                conversation_id,
                EventKind::Assigned,
                json!({ "agent_id": agent, "auto": true }),
            )
            .await;
        }
        Ok(assigned)
    }

    /// A staff member pulls an unassigned conversation to themselves.
    /// First writer wins; re-claiming one's own conversation is a no-op
    /// success. Capacity is advisory here: an explicit human claim is never
    /// blocked by it.
    pub async fn claim(&self, claims: &Claims, conversation_id: Uuid) -> CoreResult<Conversation> {
        if !claims.role.is_staff() {
            return Err(CoreError::Forbidden);
        }
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !conversation.is_open() {
            return Err(CoreError::ConversationClosed);
        }

        let already_mine = conversation.assigned_agent_id == Some(claims.user_id);
        let applied = self
            .store
            .assign_if_unassigned_or_self(claims.tenant_id, conversation_id, claims.user_id)
            .await?;
        if !applied {
            return Err(CoreError::ClaimFailed);
        }

        if !already_mine {
            self.emit(
                claims.tenant_id,
                conversation_id,
                EventKind::Claimed,
                json!({ "agent_id": claims.user_id }),
            )
            .await;
        }

        self.store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)
    }

    /// Unconditional assignment override: hand the conversation to `agent`
    /// regardless of its current state, reopening it if closed.
    pub async fn assign(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
        agent: Uuid,
    ) -> CoreResult<Conversation> {
        let allowed = match self.assign_policy {
            AssignPolicy::AnyStaff => claims.role.is_staff(),
            AssignPolicy::AdminOnly => claims.role == chatwire_shared::Role::Admin,
        };
        if !allowed {
            return Err(CoreError::Forbidden);
        }
        if self
            .store
            .agent_profile(claims.tenant_id, agent)
            .await?
            .is_none()
        {
            return Err(CoreError::AgentNotFound);
        }

        let previous = self
            .store
            .assign_override(claims.tenant_id, conversation_id, agent)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;

        if previous != Some(agent) {
            self.emit(
                claims.tenant_id,
                conversation_id,
                EventKind::Transferred,
                json!({ "agent_id": agent, "previous_agent_id": previous, "by": claims.user_id }),
            )
            .await;
        }

        self.store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)
    }

    /// Drain the tenant's queue oldest-first. Returns how many conversations
    /// were placed.
    pub async fn try_assign_from_queue(&self, tenant_id: Uuid, limit: i64) -> CoreResult<u64> {
        let queued = self.store.queued_oldest_first(tenant_id, limit).await?;
        let mut placed = 0;
        for conversation in queued {
            if self
                .auto_assign(tenant_id, conversation.id, None)
                .await?
                .is_some()
            {
                placed += 1;
            }
        }
        Ok(placed)
    }

    /// Backfill one agent who just came online with queued conversations
    /// visible to them, up to `max` and never beyond their capacity.
    pub async fn try_assign_from_queue_to_agent(
        &self,
        tenant_id: Uuid,
        agent: Uuid,
        max: i64,
    ) -> CoreResult<Vec<Uuid>> {
        let Some(profile) = self.store.agent_profile(tenant_id, agent).await? else {
            return Ok(Vec::new());
        };
        if profile.status != AgentStatus::Online {
            return Ok(Vec::new());
        }

        let scan = (max.saturating_mul(5)).min(MAX_BACKFILL_SCAN);
        let queued = self
            .store
            .queued_visible_to_agent(tenant_id, agent, scan)
            .await?;

        let mut placed = Vec::new();
        for conversation in queued {
            if placed.len() as i64 >= max {
                break;
            }
            // Capacity is re-checked inside the conditional assign.
            if self
                .store
                .assign_if_unassigned(tenant_id, conversation.id, agent)
                .await?
            {
                self.emit(
                    tenant_id,
                    conversation.id,
                    EventKind::Assigned,
                    json!({ "agent_id": agent, "on_connect": true }),
                )
                .await;
                placed.push(conversation.id);
            }
        }
        Ok(placed)
    }

    /// Update an agent's stored availability, enrolling them in the tenant's
    /// fallback group on first sight.
    pub async fn set_agent_status(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        status: AgentStatus,
    ) -> CoreResult<()> {
        self.store
            .upsert_agent_status(tenant_id, user_id, status)
            .await?;
        self.store.enroll_in_fallback(tenant_id, user_id).await
    }

    // -- helpers -------------------------------------------------------------

    /// Resolve the routing pool for a conversation with liveness folded in:
    /// its skill group when at least one member is live, otherwise the
    /// tenant-wide pool. A group whose members are all offline must not
    /// strand the conversation. Returns the fairness-cursor key alongside.
    async fn resolve_live_pool(
        &self,
        conversation: &Conversation,
        exclude: Option<Uuid>,
    ) -> CoreResult<(String, Vec<Candidate>)> {
        let tenant_id = conversation.tenant_id;
        if let Some(group_id) = conversation.skill_group_id {
            let members = self.store.group_members(tenant_id, group_id).await?;
            let pool: Vec<(Uuid, i32)> = members
                .into_iter()
                .map(|m| (m.agent_user_id, m.weight))
                .collect();
            let live = self.live_candidates(tenant_id, &pool, exclude).await?;
            if !live.is_empty() {
                return Ok((group_id.to_string(), live));
            }
        }
        let staff = self.store.staff_agents(tenant_id).await?;
        let pool: Vec<(Uuid, i32)> = staff.into_iter().map(|u| (u, 0)).collect();
        let live = self.live_candidates(tenant_id, &pool, exclude).await?;
        Ok((DEFAULT_GROUP_KEY.to_string(), live))
    }

    /// Stored-online candidates who also hold a live presence session.
    async fn live_candidates(
        &self,
        tenant_id: Uuid,
        pool: &[(Uuid, i32)],
        exclude: Option<Uuid>,
    ) -> CoreResult<Vec<Candidate>> {
        let pool: Vec<(Uuid, i32)> = pool
            .iter()
            .filter(|(u, _)| Some(*u) != exclude)
            .copied()
            .collect();
        let stored_online = self.store.candidates_for(tenant_id, &pool).await?;
        let mut live = Vec::with_capacity(stored_online.len());
        for candidate in stored_online {
            if self
                .presence
                .has_active_session(tenant_id, candidate.user_id)
                .await?
            {
                live.push(candidate);
            }
        }
        Ok(live)
    }

    /// Try to take the cursor lock, retrying briefly on `Busy`. `None` means
    /// proceed without fairness protection.
    async fn acquire_cursor_lock(&self, key: &str) -> Option<String> {
        let retry = FixedInterval::from_millis(25).take(3);
        let attempt = Retry::spawn(retry, || async {
            match self.locks.try_lock(key, CURSOR_LOCK_TTL).await {
                LockAttempt::Busy => Err(LockAttempt::Busy),
                other => Ok(other),
            }
        })
        .await
        .unwrap_or(LockAttempt::Busy);

        match attempt {
            LockAttempt::Acquired(token) => Some(token),
            LockAttempt::Busy => {
                tracing::debug!(key = %key, "Cursor busy, proceeding without fairness lock");
                None
            }
            LockAttempt::Unavailable => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatwire_shared::{AgentProfile, Claims, GroupMembership, Role, SkillGroup};

    use super::*;
    use crate::lock::{MemoryLock, UnavailableLock};
    use crate::presence::{MemoryPresence, Presence};
    use crate::store::{ConversationStore, MemoryStore, NewConversation};

    fn agent(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    async fn engine_with(store: Arc<MemoryStore>, presence: Arc<MemoryPresence>) -> Engine {
        Engine::new(store, presence, Arc::new(MemoryLock::new()))
    }

    async fn seed_online_agent(
        store: &MemoryStore,
        presence: &MemoryPresence,
        tenant: Uuid,
        user: Uuid,
        max_concurrent: i32,
    ) {
        store.put_agent_profile(AgentProfile {
            user_id: user,
            tenant_id: tenant,
            status: AgentStatus::Online,
            max_concurrent,
        }).await;
        presence.create_session(tenant, user).await.unwrap();
    }

    async fn queue_conversation(store: &MemoryStore, tenant: Uuid) -> Uuid {
        store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: Some("cust".into()),
                skill_group_id: None,
                site_id: None,
                visitor_id: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_round_robin_rotates_through_pool() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        for n in 1..=3 {
            seed_online_agent(&store, &presence, tenant, agent(n), 5).await;
        }
        let engine = engine_with(store.clone(), presence).await;

        let mut picks = Vec::new();
        for _ in 0..3 {
            let conv = queue_conversation(&store, tenant).await;
            picks.push(engine.auto_assign(tenant, conv, None).await.unwrap());
        }
        assert_eq!(
            picks,
            vec![Some(agent(1)), Some(agent(2)), Some(agent(3))]
        );

        // Wraps back to the first agent
        let conv = queue_conversation(&store, tenant).await;
        assert_eq!(
            engine.auto_assign(tenant, conv, None).await.unwrap(),
            Some(agent(1))
        );
    }

    #[tokio::test]
    async fn test_capacity_skips_full_agents() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 1).await;
        seed_online_agent(&store, &presence, tenant, agent(2), 2).await;
        let engine = engine_with(store.clone(), presence).await;

        let c1 = queue_conversation(&store, tenant).await;
        let c2 = queue_conversation(&store, tenant).await;
        let c3 = queue_conversation(&store, tenant).await;
        let c4 = queue_conversation(&store, tenant).await;

        assert_eq!(engine.auto_assign(tenant, c1, None).await.unwrap(), Some(agent(1)));
        assert_eq!(engine.auto_assign(tenant, c2, None).await.unwrap(), Some(agent(2)));
        // Agent 1 is at capacity now, so agent 2 absorbs the third
        assert_eq!(engine.auto_assign(tenant, c3, None).await.unwrap(), Some(agent(2)));
        // Everyone full: the fourth stays queued
        assert_eq!(engine.auto_assign(tenant, c4, None).await.unwrap(), None);
        let conv = store.conversation(tenant, c4).await.unwrap().unwrap();
        assert_eq!(conv.status, ConversationStatus::Queued);
    }

    #[tokio::test]
    async fn test_offline_and_away_agents_are_skipped() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));

        // Stored online but no live session
        store.put_agent_profile(AgentProfile {
            user_id: agent(1),
            tenant_id: tenant,
            status: AgentStatus::Online,
            max_concurrent: 5,
        }).await;
        // Live session but stored away
        store.put_agent_profile(AgentProfile {
            user_id: agent(2),
            tenant_id: tenant,
            status: AgentStatus::Away,
            max_concurrent: 5,
        }).await;
        presence.create_session(tenant, agent(2)).await.unwrap();
        // Fully available
        seed_online_agent(&store, &presence, tenant, agent(3), 5).await;

        let engine = engine_with(store.clone(), presence).await;
        let conv = queue_conversation(&store, tenant).await;
        assert_eq!(
            engine.auto_assign(tenant, conv, None).await.unwrap(),
            Some(agent(3))
        );
    }

    #[tokio::test]
    async fn test_group_routing_and_weight_order() {
        let tenant = Uuid::new_v4();
        let group = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        store.put_group(SkillGroup {
            id: group,
            tenant_id: tenant,
            name: "Billing".into(),
            enabled: true,
            is_fallback: false,
        }).await;
        for (n, weight) in [(1u128, 0), (2, 10)] {
            seed_online_agent(&store, &presence, tenant, agent(n), 5).await;
            store.put_membership(GroupMembership {
                group_id: group,
                agent_user_id: agent(n),
                weight,
            }).await;
        }
        // Staff outside the group must not receive group traffic
        seed_online_agent(&store, &presence, tenant, agent(9), 5).await;
        let engine = engine_with(store.clone(), presence).await;

        let conv = store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: None,
                skill_group_id: Some(group),
                site_id: None,
                visitor_id: None,
            })
            .await
            .unwrap()
            .id;
        // Higher weight heads the ring
        assert_eq!(
            engine.auto_assign(tenant, conv, None).await.unwrap(),
            Some(agent(2))
        );
    }

    #[tokio::test]
    async fn test_empty_group_falls_back_to_tenant_pool() {
        let tenant = Uuid::new_v4();
        let group = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        store.put_group(SkillGroup {
            id: group,
            tenant_id: tenant,
            name: "Empty".into(),
            enabled: true,
            is_fallback: false,
        }).await;
        seed_online_agent(&store, &presence, tenant, agent(1), 5).await;
        let engine = engine_with(store.clone(), presence).await;

        let conv = store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: None,
                skill_group_id: Some(group),
                site_id: None,
                visitor_id: None,
            })
            .await
            .unwrap()
            .id;
        assert_eq!(
            engine.auto_assign(tenant, conv, None).await.unwrap(),
            Some(agent(1))
        );
    }

    #[tokio::test]
    async fn test_offline_group_falls_back_to_tenant_pool() {
        let tenant = Uuid::new_v4();
        let group = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        store.put_group(SkillGroup {
            id: group,
            tenant_id: tenant,
            name: "Night shift".into(),
            enabled: true,
            is_fallback: false,
        }).await;
        // Group member is stored online but holds no live session
        store.put_agent_profile(AgentProfile {
            user_id: agent(1),
            tenant_id: tenant,
            status: AgentStatus::Online,
            max_concurrent: 5,
        }).await;
        store.put_membership(GroupMembership {
            group_id: group,
            agent_user_id: agent(1),
            weight: 0,
        }).await;
        // Live staff agent outside the group
        seed_online_agent(&store, &presence, tenant, agent(9), 5).await;
        let engine = engine_with(store.clone(), presence).await;

        let conv = store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: None,
                skill_group_id: Some(group),
                site_id: None,
                visitor_id: None,
            })
            .await
            .unwrap()
            .id;
        // Nobody in the group is live, so the tenant-wide pool takes over
        assert_eq!(
            engine.auto_assign(tenant, conv, None).await.unwrap(),
            Some(agent(9))
        );
    }

    #[tokio::test]
    async fn test_exclude_drops_agent_from_pool() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 5).await;
        let engine = engine_with(store.clone(), presence).await;

        let conv = queue_conversation(&store, tenant).await;
        // The only online agent is excluded, so nothing is placed
        assert_eq!(
            engine.auto_assign(tenant, conv, Some(agent(1))).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_assignment_survives_lock_outage() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 5).await;
        let engine = Engine::new(store.clone(), presence, Arc::new(UnavailableLock));

        let conv = queue_conversation(&store, tenant).await;
        assert_eq!(
            engine.auto_assign(tenant, conv, None).await.unwrap(),
            Some(agent(1))
        );
    }

    #[tokio::test]
    async fn test_claim_first_writer_wins() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 5).await;
        seed_online_agent(&store, &presence, tenant, agent(2), 5).await;
        let engine = engine_with(store.clone(), presence).await;

        let conv = queue_conversation(&store, tenant).await;
        let first = Claims {
            user_id: agent(1),
            tenant_id: tenant,
            role: Role::Agent,
            site_id: None,
        };
        let second = Claims {
            user_id: agent(2),
            tenant_id: tenant,
            role: Role::Agent,
            site_id: None,
        };

        let claimed = engine.claim(&first, conv).await.unwrap();
        assert_eq!(claimed.assigned_agent_id, Some(agent(1)));
        // Loser gets a claim conflict
        assert!(matches!(
            engine.claim(&second, conv).await,
            Err(CoreError::ClaimFailed)
        ));
        // Re-claiming one's own conversation stays a success
        assert!(engine.claim(&first, conv).await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_rejected_for_non_staff() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        let engine = engine_with(store.clone(), presence).await;

        let conv = queue_conversation(&store, tenant).await;
        let claims = Claims {
            user_id: Uuid::new_v4(),
            tenant_id: tenant,
            role: Role::Customer,
            site_id: None,
        };
        assert!(matches!(
            engine.claim(&claims, conv).await,
            Err(CoreError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_assign_override_policy_and_transfer() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 5).await;
        seed_online_agent(&store, &presence, tenant, agent(2), 5).await;
        let engine = engine_with(store.clone(), presence)
            .await
            .with_assign_policy(AssignPolicy::AdminOnly);

        let conv = queue_conversation(&store, tenant).await;
        let agent_claims = Claims {
            user_id: agent(1),
            tenant_id: tenant,
            role: Role::Agent,
            site_id: None,
        };
        assert!(matches!(
            engine.assign(&agent_claims, conv, agent(2)).await,
            Err(CoreError::Forbidden)
        ));

        let admin = Claims {
            user_id: Uuid::new_v4(),
            tenant_id: tenant,
            role: Role::Admin,
            site_id: None,
        };
        let updated = engine.assign(&admin, conv, agent(1)).await.unwrap();
        assert_eq!(updated.assigned_agent_id, Some(agent(1)));
        // Override moves it even while assigned
        let updated = engine.assign(&admin, conv, agent(2)).await.unwrap();
        assert_eq!(updated.assigned_agent_id, Some(agent(2)));
        // Unknown target agent is rejected
        assert!(matches!(
            engine.assign(&admin, conv, Uuid::new_v4()).await,
            Err(CoreError::AgentNotFound)
        ));
    }

    #[tokio::test]
    async fn test_backfill_respects_max_and_capacity() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 2).await;
        let engine = engine_with(store.clone(), presence).await;

        for _ in 0..4 {
            queue_conversation(&store, tenant).await;
        }
        // max 3 requested, but capacity 2 wins
        let placed = engine
            .try_assign_from_queue_to_agent(tenant, agent(1), 3)
            .await
            .unwrap();
        assert_eq!(placed.len(), 2);
        assert_eq!(store.active_assigned_count(tenant, agent(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backfill_skips_non_online_agent() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        store.put_agent_profile(AgentProfile {
            user_id: agent(1),
            tenant_id: tenant,
            status: AgentStatus::Away,
            max_concurrent: 5,
        }).await;
        presence.create_session(tenant, agent(1)).await.unwrap();
        let engine = engine_with(store.clone(), presence).await;

        queue_conversation(&store, tenant).await;
        let placed = engine
            .try_assign_from_queue_to_agent(tenant, agent(1), 3)
            .await
            .unwrap();
        assert!(placed.is_empty());
    }

    #[tokio::test]
    async fn test_queue_drain_places_oldest_first() {
        let tenant = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        seed_online_agent(&store, &presence, tenant, agent(1), 1).await;
        let engine = engine_with(store.clone(), presence).await;

        let first = queue_conversation(&store, tenant).await;
        let second = queue_conversation(&store, tenant).await;

        assert_eq!(engine.try_assign_from_queue(tenant, 10).await.unwrap(), 1);
        let placed = store.conversation(tenant, first).await.unwrap().unwrap();
        assert_eq!(placed.assigned_agent_id, Some(agent(1)));
        let waiting = store.conversation(tenant, second).await.unwrap().unwrap();
        assert_eq!(waiting.status, ConversationStatus::Queued);
    }
}
