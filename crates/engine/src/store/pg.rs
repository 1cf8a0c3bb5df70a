//! Postgres storage backend
//!
//! Conditional semantics live inside the SQL statements themselves: every
//! CAS is a single `UPDATE .. WHERE <precondition>` whose row count reports
//! the outcome. The capacity guard on assignment is the one multi-statement
//! transaction: it locks the agent profile row, recounts on a fresh snapshot,
//! then applies the conditional update, so racing assigns to the same agent
//! serialize.

use async_trait::async_trait;
use chatwire_shared::{
    AgentProfile, AgentStatus, AttachmentMeta, Candidate, Conversation, ConversationStatus,
    CoreError, CoreResult, EventKind, GroupMembership, LifecycleEvent, Message, MessageKind,
    SenderKind, SkillGroup, TenantSettings,
};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ConversationStore, MessageCursor, NewConversation, NewMessage};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Row types
// =============================================================================

const CONVERSATION_COLUMNS: &str = "id, tenant_id, customer_ref, assigned_agent_id, \
     skill_group_id, status, site_id, visitor_id, created_at, last_msg_at, \
     last_customer_msg_at, last_idle_event_at, closed_at, archived_reason";

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    tenant_id: Uuid,
    customer_ref: Option<String>,
    assigned_agent_id: Option<Uuid>,
    skill_group_id: Option<Uuid>,
    status: String,
    site_id: Option<Uuid>,
    visitor_id: Option<Uuid>,
    created_at: OffsetDateTime,
    last_msg_at: OffsetDateTime,
    last_customer_msg_at: Option<OffsetDateTime>,
    last_idle_event_at: Option<OffsetDateTime>,
    closed_at: Option<OffsetDateTime>,
    archived_reason: Option<String>,
}

impl ConversationRow {
    fn into_domain(self) -> CoreResult<Conversation> {
        let status = ConversationStatus::parse(&self.status)
            .ok_or_else(|| CoreError::Storage(format!("unknown conversation status: {}", self.status)))?;
        Ok(Conversation {
            id: self.id,
            tenant_id: self.tenant_id,
            customer_ref: self.customer_ref,
            assigned_agent_id: self.assigned_agent_id,
            skill_group_id: self.skill_group_id,
            status,
            site_id: self.site_id,
            visitor_id: self.visitor_id,
            created_at: self.created_at,
            last_msg_at: self.last_msg_at,
            last_customer_msg_at: self.last_customer_msg_at,
            last_idle_event_at: self.last_idle_event_at,
            closed_at: self.closed_at,
            archived_reason: self.archived_reason,
        })
    }
}

fn rows_into_conversations(rows: Vec<ConversationRow>) -> CoreResult<Vec<Conversation>> {
    rows.into_iter().map(ConversationRow::into_domain).collect()
}

const MESSAGE_COLUMNS: &str =
    "id, tenant_id, conversation_id, sender_kind, sender_id, client_msg_id, kind, body, \
     attachment_id, created_at";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    tenant_id: Uuid,
    conversation_id: Uuid,
    sender_kind: String,
    sender_id: Uuid,
    client_msg_id: String,
    kind: String,
    body: String,
    attachment_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl MessageRow {
    fn into_domain(self) -> CoreResult<Message> {
        let sender_kind = SenderKind::parse(&self.sender_kind)
            .ok_or_else(|| CoreError::Storage(format!("unknown sender kind: {}", self.sender_kind)))?;
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| CoreError::Storage(format!("unknown message kind: {}", self.kind)))?;
        Ok(Message {
            id: self.id,
            tenant_id: self.tenant_id,
            conversation_id: self.conversation_id,
            sender_kind,
            sender_id: self.sender_id,
            client_msg_id: self.client_msg_id,
            kind,
            body: self.body,
            attachment_id: self.attachment_id,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    tenant_id: Uuid,
    conversation_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    created_at: OffsetDateTime,
}

impl EventRow {
    fn into_domain(self) -> CoreResult<LifecycleEvent> {
        let kind = EventKind::parse(&self.kind)
            .ok_or_else(|| CoreError::Storage(format!("unknown event kind: {}", self.kind)))?;
        Ok(LifecycleEvent {
            id: self.id,
            tenant_id: self.tenant_id,
            conversation_id: self.conversation_id,
            kind,
            payload: self.payload,
            created_at: self.created_at,
        })
    }
}

// =============================================================================
// Store implementation
// =============================================================================

#[async_trait]
impl ConversationStore for PgStore {
    async fn insert_conversation(&self, new: NewConversation) -> CoreResult<Conversation> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            INSERT INTO conversations
                (id, tenant_id, customer_ref, skill_group_id, site_id, visitor_id,
                 status, created_at, last_msg_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', NOW(), NOW())
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.customer_ref)
        .bind(new.skill_group_id)
        .bind(new.site_id)
        .bind(new.visitor_id)
        .fetch_one(&self.pool)
        .await?;
        row.into_domain()
    }

    async fn conversation(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ConversationRow::into_domain).transpose()
    }

    async fn assign_if_unassigned(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        // The capacity check must run in a statement of its own, after the
        // profile-row lock is granted: under READ COMMITTED a blocked locker
        // resumes on its original snapshot, so a count embedded in the same
        // statement would not see a concurrent assignment that committed
        // while we waited.
        let mut tx = self.pool.begin().await?;
        let cap: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT max_concurrent FROM agent_profiles
            WHERE tenant_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(agent)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((max_concurrent,)) = cap else {
            return Ok(false);
        };

        let (active,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM conversations
            WHERE tenant_id = $1 AND assigned_agent_id = $2 AND status = 'assigned'
            "#,
        )
        .bind(tenant_id)
        .bind(agent)
        .fetch_one(&mut *tx)
        .await?;
        if active >= i64::from(max_concurrent) {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 'assigned', assigned_agent_id = $3
            WHERE tenant_id = $1 AND id = $2
              AND status = 'queued' AND assigned_agent_id IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(agent)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_if_unassigned_or_self(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 'assigned', assigned_agent_id = $3
            WHERE tenant_id = $1 AND id = $2 AND status <> 'closed'
              AND (assigned_agent_id IS NULL OR assigned_agent_id = $3)
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(agent)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_override(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<Option<Option<Uuid>>> {
        let previous: Option<(Option<Uuid>,)> = sqlx::query_as(
            r#"
            UPDATE conversations c
            SET status = 'assigned', assigned_agent_id = $3,
                closed_at = NULL, archived_reason = NULL
            FROM (SELECT id, assigned_agent_id AS prev FROM conversations
                  WHERE tenant_id = $1 AND id = $2 FOR UPDATE) old
            WHERE c.id = old.id
            RETURNING old.prev
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(agent)
        .fetch_optional(&self.pool)
        .await?;
        Ok(previous.map(|(prev,)| prev))
    }

    async fn close_if_open(&self, tenant_id: Uuid, id: Uuid, reason: &str) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 'closed', closed_at = NOW(), archived_reason = $3
            WHERE tenant_id = $1 AND id = $2 AND status <> 'closed'
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reopen_to_agent_if_closed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 'assigned', assigned_agent_id = $3,
                closed_at = NULL, archived_reason = NULL
            WHERE tenant_id = $1 AND id = $2 AND status = 'closed'
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(agent)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reopen_to_queued_if_closed(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 'queued', assigned_agent_id = NULL,
                closed_at = NULL, archived_reason = NULL
            WHERE tenant_id = $1 AND id = $2 AND status = 'closed'
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unassign_if_assigned_to(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = 'queued', assigned_agent_id = NULL
            WHERE tenant_id = $1 AND id = $2
              AND status = 'assigned' AND assigned_agent_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(agent)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_last_msg(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: OffsetDateTime,
        customer: bool,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_msg_at = GREATEST(last_msg_at, $3),
                last_customer_msg_at = CASE WHEN $4 THEN $3 ELSE last_customer_msg_at END
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(at)
        .bind(customer)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_idle_event_fired(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: OffsetDateTime,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET last_idle_event_at = $3
            WHERE tenant_id = $1 AND id = $2
              AND (last_idle_event_at IS NULL
                   OR last_idle_event_at < COALESCE(last_customer_msg_at, created_at))
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn queued_oldest_first(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE tenant_id = $1 AND status = 'queued'
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_into_conversations(rows)
    }

    async fn queued_visible_to_agent(
        &self,
        tenant_id: Uuid,
        agent: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations c
            WHERE c.tenant_id = $1 AND c.status = 'queued'
              AND (c.skill_group_id IS NULL OR EXISTS (
                  SELECT 1 FROM group_memberships gm
                  WHERE gm.group_id = c.skill_group_id AND gm.agent_user_id = $2))
            ORDER BY c.created_at ASC, c.id ASC
            LIMIT $3
            "#
        ))
        .bind(tenant_id)
        .bind(agent)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows_into_conversations(rows)
    }

    async fn idle_candidates(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE tenant_id = $1 AND status <> 'closed'
              AND COALESCE(last_customer_msg_at, created_at) < $2
              AND (last_idle_event_at IS NULL
                   OR last_idle_event_at < COALESCE(last_customer_msg_at, created_at))
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(tenant_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows_into_conversations(rows)
    }

    async fn inactive_open(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE tenant_id = $1 AND status <> 'closed' AND last_msg_at < $2
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(tenant_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows_into_conversations(rows)
    }

    async fn no_reply_candidates(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations c
            WHERE c.tenant_id = $1 AND c.status = 'assigned'
              AND c.last_customer_msg_at IS NOT NULL
              AND c.last_customer_msg_at < $2
              AND NOT EXISTS (
                  SELECT 1 FROM messages m
                  WHERE m.conversation_id = c.id AND m.sender_kind = 'agent'
                    AND m.created_at > c.last_customer_msg_at)
            ORDER BY c.created_at ASC, c.id ASC
            "#
        ))
        .bind(tenant_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows_into_conversations(rows)
    }

    async fn agent_profile(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<Option<AgentProfile>> {
        let row: Option<(String, i32)> = sqlx::query_as(
            "SELECT status, max_concurrent FROM agent_profiles WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((status, max_concurrent)) => {
                let status = AgentStatus::parse(&status)
                    .ok_or_else(|| CoreError::Storage(format!("unknown agent status: {status}")))?;
                Ok(Some(AgentProfile {
                    user_id,
                    tenant_id,
                    status,
                    max_concurrent,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_agent_status(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        status: AgentStatus,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_profiles (tenant_id, user_id, status, max_concurrent)
            VALUES ($1, $2, $3, 3)
            ON CONFLICT (tenant_id, user_id) DO UPDATE SET status = $3
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_assigned_count(&self, tenant_id: Uuid, agent: Uuid) -> CoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM conversations
            WHERE tenant_id = $1 AND assigned_agent_id = $2 AND status = 'assigned'
            "#,
        )
        .bind(tenant_id)
        .bind(agent)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn group_members(
        &self,
        tenant_id: Uuid,
        group_id: Uuid,
    ) -> CoreResult<Vec<GroupMembership>> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT gm.agent_user_id, gm.weight
            FROM group_memberships gm
            JOIN skill_groups g ON g.id = gm.group_id
            WHERE g.id = $2 AND g.tenant_id = $1 AND g.enabled
            "#,
        )
        .bind(tenant_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(agent_user_id, weight)| GroupMembership {
                group_id,
                agent_user_id,
                weight,
            })
            .collect())
    }

    async fn staff_agents(&self, tenant_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM agent_profiles WHERE tenant_id = $1 ORDER BY user_id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    async fn candidates_for(
        &self,
        tenant_id: Uuid,
        users: &[(Uuid, i32)],
    ) -> CoreResult<Vec<Candidate>> {
        let mut candidates = Vec::with_capacity(users.len());
        for (user_id, weight) in users {
            let row: Option<(String, i32, i64)> = sqlx::query_as(
                r#"
                SELECT p.status, p.max_concurrent,
                       (SELECT COUNT(*) FROM conversations c
                        WHERE c.tenant_id = $1 AND c.assigned_agent_id = $2
                          AND c.status = 'assigned') AS active_count
                FROM agent_profiles p
                WHERE p.tenant_id = $1 AND p.user_id = $2
                "#,
            )
            .bind(tenant_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some((status, max_concurrent, active_count)) = row {
                if AgentStatus::parse(&status) == Some(AgentStatus::Online) {
                    candidates.push(Candidate {
                        user_id: *user_id,
                        weight: *weight,
                        max_concurrent,
                        active_count,
                    });
                }
            }
        }
        Ok(candidates)
    }

    async fn ensure_fallback_group(&self, tenant_id: Uuid) -> CoreResult<SkillGroup> {
        let existing: Option<(Uuid, String, bool)> = sqlx::query_as(
            "SELECT id, name, enabled FROM skill_groups WHERE tenant_id = $1 AND is_fallback",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((id, name, enabled)) = existing {
            return Ok(SkillGroup {
                id,
                tenant_id,
                name,
                enabled,
                is_fallback: true,
            });
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO skill_groups (id, tenant_id, name, enabled, is_fallback)
            VALUES ($1, $2, 'General', TRUE, TRUE)
            ON CONFLICT (tenant_id) WHERE is_fallback DO NOTHING
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        // Re-read: a concurrent caller may have won the insert
        let (id, name, enabled): (Uuid, String, bool) = sqlx::query_as(
            "SELECT id, name, enabled FROM skill_groups WHERE tenant_id = $1 AND is_fallback",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(SkillGroup {
            id,
            tenant_id,
            name,
            enabled,
            is_fallback: true,
        })
    }

    async fn enroll_in_fallback(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        let group = self.ensure_fallback_group(tenant_id).await?;
        sqlx::query(
            r#"
            INSERT INTO group_memberships (group_id, agent_user_id, weight)
            VALUES ($1, $2, 0)
            ON CONFLICT (group_id, agent_user_id) DO NOTHING
            "#,
        )
        .bind(group.id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cursor_last(&self, tenant_id: Uuid, group_key: &str) -> CoreResult<Option<Uuid>> {
        let row: Option<(Option<Uuid>,)> = sqlx::query_as(
            "SELECT last_agent_user_id FROM assignment_cursors WHERE tenant_id = $1 AND group_key = $2",
        )
        .bind(tenant_id)
        .bind(group_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(last,)| last))
    }

    async fn cursor_set(&self, tenant_id: Uuid, group_key: &str, agent: Uuid) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO assignment_cursors (tenant_id, group_key, last_agent_user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, group_key) DO UPDATE SET last_agent_user_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(group_key)
        .bind(agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message(&self, new: NewMessage) -> CoreResult<(Message, bool)> {
        let inserted = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            INSERT INTO messages
                (id, tenant_id, conversation_id, sender_kind, sender_id,
                 client_msg_id, kind, body, attachment_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (tenant_id, sender_id, client_msg_id) DO NOTHING
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.conversation_id)
        .bind(new.sender_kind.as_str())
        .bind(new.sender_id)
        .bind(&new.client_msg_id)
        .bind(new.kind.as_str())
        .bind(&new.body)
        .bind(new.attachment_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into_domain()?, true));
        }

        // Duplicate submission: return the original row
        let existing = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE tenant_id = $1 AND sender_id = $2 AND client_msg_id = $3
            "#
        ))
        .bind(new.tenant_id)
        .bind(new.sender_id)
        .bind(&new.client_msg_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing.into_domain()?, false))
    }

    async fn message(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MessageRow::into_domain).transpose()
    }

    async fn messages_page(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> CoreResult<Vec<Message>> {
        let rows = match after {
            Some(cursor) => {
                sqlx::query_as::<_, MessageRow>(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE tenant_id = $1 AND conversation_id = $2
                      AND (created_at, id) > ($3, $4)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $5
                    "#
                ))
                .bind(tenant_id)
                .bind(conversation_id)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MessageRow>(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE tenant_id = $1 AND conversation_id = $2
                    ORDER BY created_at ASC, id ASC
                    LIMIT $3
                    "#
                ))
                .bind(tenant_id)
                .bind(conversation_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(MessageRow::into_domain).collect()
    }

    async fn upsert_read_cursor(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_msg_id: Uuid,
    ) -> CoreResult<OffsetDateTime> {
        let (updated_at,): (OffsetDateTime,) = sqlx::query_as(
            r#"
            INSERT INTO read_cursors
                (tenant_id, conversation_id, user_id, last_read_msg_id, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (tenant_id, conversation_id, user_id)
            DO UPDATE SET last_read_msg_id = $4, updated_at = NOW()
            RETURNING updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(last_read_msg_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated_at)
    }

    async fn insert_event(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> CoreResult<LifecycleEvent> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO lifecycle_events (id, tenant_id, conversation_id, kind, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, tenant_id, conversation_id, kind, payload, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(conversation_id)
        .bind(kind.as_str())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        row.into_domain()
    }

    async fn events_for(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<LifecycleEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, tenant_id, conversation_id, kind, payload, created_at
            FROM lifecycle_events
            WHERE tenant_id = $1 AND conversation_id = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_domain).collect()
    }

    async fn attachment_meta(
        &self,
        tenant_id: Uuid,
        attachment_id: Uuid,
    ) -> CoreResult<Option<AttachmentMeta>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT file_name, content_type, size_bytes
            FROM attachments
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(attachment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(file_name, content_type, size_bytes)| AttachmentMeta {
            id: attachment_id,
            tenant_id,
            file_name,
            content_type,
            size_bytes,
        }))
    }

    async fn site_allowed_origins(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
    ) -> CoreResult<Vec<String>> {
        let row: Option<(Vec<String>,)> = sqlx::query_as(
            "SELECT allowed_origins FROM sites WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(origins,)| origins).unwrap_or_default())
    }

    async fn list_active_tenants(&self) -> CoreResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM tenants WHERE is_active ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn tenant_settings(&self, tenant_id: Uuid) -> CoreResult<Option<TenantSettings>> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT idle_after_minutes, archive_after_minutes,
                   no_reply_after_minutes, queue_drain_batch
            FROM tenant_settings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(idle_after_minutes, archive_after_minutes, no_reply_after_minutes, queue_drain_batch)| {
                TenantSettings {
                    idle_after_minutes,
                    archive_after_minutes,
                    no_reply_after_minutes,
                    queue_drain_batch,
                }
            },
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chatwire_shared::db::{create_pool, run_migrations};

    use super::*;
    use crate::store::ConversationStore;

    async fn test_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, 5).await.expect("Failed to create pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
        PgStore::new(pool)
    }

    async fn seed_tenant_agent(store: &PgStore, max_concurrent: i32) -> (Uuid, Uuid) {
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        sqlx::query("INSERT INTO tenants (id, name) VALUES ($1, 'capacity-test')")
            .bind(tenant)
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO agent_profiles (tenant_id, user_id, status, max_concurrent)
            VALUES ($1, $2, 'online', $3)
            "#,
        )
        .bind(tenant)
        .bind(agent)
        .bind(max_concurrent)
        .execute(&store.pool)
        .await
        .unwrap();
        (tenant, agent)
    }

    async fn seed_queued(store: &PgStore, tenant: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO conversations (id, tenant_id, status) VALUES ($1, $2, 'queued')")
            .bind(id)
            .bind(tenant)
            .execute(&store.pool)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_concurrent_assigns_respect_max_concurrent() {
        let store = test_store().await;
        let (tenant, agent) = seed_tenant_agent(&store, 1).await;
        let c1 = seed_queued(&store, tenant).await;
        let c2 = seed_queued(&store, tenant).await;

        // Both racers target the same agent with a single free slot; the
        // profile-row lock plus the post-lock recount lets only one through.
        let (a, b) = tokio::join!(
            store.assign_if_unassigned(tenant, c1, agent),
            store.assign_if_unassigned(tenant, c2, agent),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one assignment must win, got {a} and {b}");
        assert_eq!(store.active_assigned_count(tenant, agent).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_assign_rejected_for_unknown_agent() {
        let store = test_store().await;
        let (tenant, _) = seed_tenant_agent(&store, 1).await;
        let conv = seed_queued(&store, tenant).await;

        let applied = store
            .assign_if_unassigned(tenant, conv, Uuid::new_v4())
            .await
            .unwrap();
        assert!(!applied);
    }
}
