//! Conversation lifecycle transitions
//!
//! Creation, archival, reopening, and the scheduler-facing transitions
//! (idle notification, inactivity archival, no-reply transfer). Every
//! transition persists first and emits its lifecycle event after the fact;
//! transitions racing each other resolve through the store's conditional
//! updates, so each event fires at most once per state change.

use chatwire_shared::{
    Claims, Conversation, CoreError, CoreResult, EventKind, LifecycleEvent, Role,
};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::NewConversation;
use crate::Engine;

impl Engine {
    /// Open a new conversation. It enters the queue, a `started` event is
    /// recorded, and an immediate placement attempt runs. Returns the
    /// conversation in its post-placement state.
    pub async fn create_conversation(&self, new: NewConversation) -> CoreResult<Conversation> {
        let tenant_id = new.tenant_id;
        let conversation = self.store.insert_conversation(new).await?;
        self.emit(
            tenant_id,
            conversation.id,
            EventKind::Started,
            json!({ "skill_group_id": conversation.skill_group_id }),
        )
        .await;

        self.auto_assign(tenant_id, conversation.id, None).await?;
        self.store
            .conversation(tenant_id, conversation.id)
            .await?
            .ok_or(CoreError::ConversationNotFound)
    }

    /// Fetch a conversation the caller is allowed to see. Staff see the
    /// whole tenant; customers and visitors only their own.
    pub async fn authorized_conversation(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
    ) -> CoreResult<Conversation> {
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }
        Ok(conversation)
    }

    /// Archive a conversation. Staff can close anything in their tenant;
    /// customers and visitors only their own. Already-closed conversations
    /// are returned unchanged and emit nothing.
    pub async fn close_conversation(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
        reason: &str,
    ) -> CoreResult<Conversation> {
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }

        if self
            .store
            .close_if_open(claims.tenant_id, conversation_id, reason)
            .await?
        {
            self.emit(
                claims.tenant_id,
                conversation_id,
                EventKind::Archived,
                json!({ "reason": reason, "by": claims.user_id }),
            )
            .await;
        }
        self.store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)
    }

    /// Scheduler-side archival of a conversation with no traffic for
    /// `minutes`. A concurrent manual close wins quietly.
    pub async fn close_for_inactivity(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        minutes: i64,
    ) -> CoreResult<bool> {
        let reason = format!("inactivity:{minutes}m");
        let closed = self
            .store
            .close_if_open(tenant_id, conversation_id, &reason)
            .await?;
        if closed {
            self.emit(
                tenant_id,
                conversation_id,
                EventKind::Archived,
                json!({ "reason": reason }),
            )
            .await;
        }
        Ok(closed)
    }

    /// A staff member reopens a closed conversation, taking the assignment
    /// themselves. Reopening an already-open conversation is a no-op
    /// success.
    pub async fn reopen_conversation(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
    ) -> CoreResult<Conversation> {
        if !claims.role.is_staff() {
            return Err(CoreError::Forbidden);
        }
        if self
            .store
            .reopen_to_agent_if_closed(claims.tenant_id, conversation_id, claims.user_id)
            .await?
        {
            self.emit(
                claims.tenant_id,
                conversation_id,
                EventKind::Reopened,
                json!({ "agent_id": claims.user_id }),
            )
            .await;
        }
        self.store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)
    }

    /// Customer-side reopen used by the messaging pipeline: `closed` goes
    /// back to `queued` and placement is retried. Loses quietly to a
    /// concurrent reopen.
    pub(crate) async fn reopen_to_queued(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> CoreResult<bool> {
        if !self
            .store
            .reopen_to_queued_if_closed(tenant_id, conversation_id)
            .await?
        {
            return Ok(false);
        }
        self.emit(
            tenant_id,
            conversation_id,
            EventKind::Reopened,
            json!({ "by_customer": true }),
        )
        .await;
        self.auto_assign(tenant_id, conversation_id, None).await?;
        Ok(true)
    }

    /// Record one idle notification for the conversation's current
    /// inactivity window. Returns `false` when the window already fired.
    pub async fn fire_idle_event(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        idle_minutes: i64,
    ) -> CoreResult<bool> {
        let fired = self
            .store
            .mark_idle_event_fired(tenant_id, conversation_id, OffsetDateTime::now_utc())
            .await?;
        if fired {
            self.emit(
                tenant_id,
                conversation_id,
                EventKind::Idle,
                json!({ "idle_minutes": idle_minutes }),
            )
            .await;
        }
        Ok(fired)
    }

    /// Move an unresponsive agent's conversation to a colleague. The
    /// conversation is tentatively returned to the queue, placement runs
    /// with the current agent excluded, and on failure the original
    /// assignment is restored so the customer never loses their agent to a
    /// transfer that found nobody.
    pub async fn transfer_no_reply(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        current_agent: Uuid,
    ) -> CoreResult<Option<Uuid>> {
        if !self
            .store
            .unassign_if_assigned_to(tenant_id, conversation_id, current_agent)
            .await?
        {
            // Assignment changed under us; nothing to transfer
            return Ok(None);
        }

        match self
            .auto_assign(tenant_id, conversation_id, Some(current_agent))
            .await?
        {
            Some(new_agent) => {
                self.emit(
                    tenant_id,
                    conversation_id,
                    EventKind::Transferred,
                    json!({
                        "agent_id": new_agent,
                        "previous_agent_id": current_agent,
                        "reason": "no_reply",
                    }),
                )
                .await;
                Ok(Some(new_agent))
            }
            None => {
                // Nobody else can take it; put it back without ceremony
                self.store
                    .assign_if_unassigned_or_self(tenant_id, conversation_id, current_agent)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Record a visitor page navigation on an open conversation.
    pub async fn record_page_view(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
        url: &str,
    ) -> CoreResult<()> {
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }
        self.emit(
            claims.tenant_id,
            conversation_id,
            EventKind::PageView,
            json!({ "url": url }),
        )
        .await;
        Ok(())
    }

    /// Event history for a conversation, oldest first. Used by SYNC replay.
    pub async fn conversation_events(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<LifecycleEvent>> {
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }
        self.store
            .events_for(claims.tenant_id, conversation_id, limit)
            .await
    }
}

/// Whether a non-staff caller is the conversation's own participant.
pub(crate) fn participant_owns(claims: &Claims, conversation: &Conversation) -> bool {
    match claims.role {
        Role::Visitor => conversation.visitor_id == Some(claims.user_id),
        Role::Customer => {
            conversation.customer_ref.as_deref() == Some(claims.user_id.to_string().as_str())
        }
        Role::Admin | Role::Agent => true,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatwire_shared::{AgentProfile, AgentStatus, ConversationStatus};

    use super::*;
    use crate::lock::MemoryLock;
    use crate::presence::{MemoryPresence, Presence};
    use crate::store::{ConversationStore, MemoryStore};

    fn claims(tenant: Uuid, user: Uuid, role: Role) -> Claims {
        Claims {
            user_id: user,
            tenant_id: tenant,
            role,
            site_id: None,
        }
    }

    fn harness() -> (Arc<MemoryStore>, Arc<MemoryPresence>, Engine) {
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new(Duration::from_secs(30)));
        let engine = Engine::new(
            store.clone(),
            presence.clone(),
            Arc::new(MemoryLock::new()),
        );
        (store, presence, engine)
    }

    async fn online_agent(
        store: &MemoryStore,
        presence: &MemoryPresence,
        tenant: Uuid,
        max: i32,
    ) -> Uuid {
        let user = Uuid::new_v4();
        store.put_agent_profile(AgentProfile {
            user_id: user,
            tenant_id: tenant,
            status: AgentStatus::Online,
            max_concurrent: max,
        }).await;
        presence.create_session(tenant, user).await.unwrap();
        user
    }

    fn new_conversation(tenant: Uuid) -> NewConversation {
        NewConversation {
            tenant_id: tenant,
            customer_ref: None,
            skill_group_id: None,
            site_id: None,
            visitor_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_immediately_when_agent_available() {
        let (store, presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let agent = online_agent(&store, &presence, tenant, 3).await;

        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Assigned);
        assert_eq!(conversation.assigned_agent_id, Some(agent));

        let kinds: Vec<EventKind> = store
            .events_for(tenant, conversation.id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Started, EventKind::Assigned]);
    }

    #[tokio::test]
    async fn test_create_queues_when_nobody_online() {
        let (_store, _presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Queued);
        assert!(conversation.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_once() {
        let (store, _presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let admin = claims(tenant, Uuid::new_v4(), Role::Admin);

        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();
        let closed = engine
            .close_conversation(&admin, conversation.id, "resolved")
            .await
            .unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert_eq!(closed.archived_reason.as_deref(), Some("resolved"));

        // Second close keeps the original reason and adds no event
        let again = engine
            .close_conversation(&admin, conversation.id, "other")
            .await
            .unwrap();
        assert_eq!(again.archived_reason.as_deref(), Some("resolved"));
        let archived = store
            .events_for(tenant, conversation.id, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EventKind::Archived)
            .count();
        assert_eq!(archived, 1);
    }

    #[tokio::test]
    async fn test_visitor_cannot_close_foreign_conversation() {
        let (_store, _presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();

        let stranger = claims(tenant, Uuid::new_v4(), Role::Visitor);
        assert!(matches!(
            engine
                .close_conversation(&stranger, conversation.id, "bye")
                .await,
            Err(CoreError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_reopen_assigns_to_reopening_agent() {
        let (store, _presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let staff = claims(tenant, agent_id, Role::Agent);

        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();
        engine
            .close_conversation(&staff, conversation.id, "resolved")
            .await
            .unwrap();

        let reopened = engine
            .reopen_conversation(&staff, conversation.id)
            .await
            .unwrap();
        assert_eq!(reopened.status, ConversationStatus::Assigned);
        assert_eq!(reopened.assigned_agent_id, Some(agent_id));
        assert!(reopened.closed_at.is_none());

        // Reopening an open conversation changes nothing further
        let again = engine
            .reopen_conversation(&staff, conversation.id)
            .await
            .unwrap();
        assert_eq!(again.assigned_agent_id, Some(agent_id));
        let reopen_events = store
            .events_for(tenant, conversation.id, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EventKind::Reopened)
            .count();
        assert_eq!(reopen_events, 1);
    }

    #[tokio::test]
    async fn test_inactivity_close_reason() {
        let (store, _presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();

        assert!(engine
            .close_for_inactivity(tenant, conversation.id, 1440)
            .await
            .unwrap());
        let closed = store
            .conversation(tenant, conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.archived_reason.as_deref(), Some("inactivity:1440m"));
        // Second pass is a no-op
        assert!(!engine
            .close_for_inactivity(tenant, conversation.id, 1440)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_idle_event_fires_once_per_window() {
        let (_store, _presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();

        assert!(engine
            .fire_idle_event(tenant, conversation.id, 5)
            .await
            .unwrap());
        assert!(!engine
            .fire_idle_event(tenant, conversation.id, 5)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_no_reply_transfer_moves_to_colleague() {
        let (store, presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let slacker = online_agent(&store, &presence, tenant, 3).await;
        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();
        assert_eq!(conversation.assigned_agent_id, Some(slacker));

        let colleague = online_agent(&store, &presence, tenant, 3).await;
        let moved = engine
            .transfer_no_reply(tenant, conversation.id, slacker)
            .await
            .unwrap();
        assert_eq!(moved, Some(colleague));
    }

    #[tokio::test]
    async fn test_no_reply_transfer_restores_when_alone() {
        let (store, presence, engine) = harness();
        let tenant = Uuid::new_v4();
        let only_agent = online_agent(&store, &presence, tenant, 3).await;
        let conversation = engine
            .create_conversation(new_conversation(tenant))
            .await
            .unwrap();

        // The sole online agent is also the current assignee: no transfer,
        // and the assignment must come back intact
        let moved = engine
            .transfer_no_reply(tenant, conversation.id, only_agent)
            .await
            .unwrap();
        assert_eq!(moved, None);
        let restored = store
            .conversation(tenant, conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.status, ConversationStatus::Assigned);
        assert_eq!(restored.assigned_agent_id, Some(only_agent));
    }
}
