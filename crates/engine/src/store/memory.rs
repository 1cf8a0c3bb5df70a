//! In-memory storage backend
//!
//! Identical observable semantics to the Postgres backend over a single
//! `Mutex`-guarded state table, which makes every conditional operation
//! atomic. Powers the engine test suite and single-process deployments.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chatwire_shared::{
    AgentProfile, AgentStatus, AttachmentMeta, Candidate, Conversation, ConversationStatus,
    CoreResult, EventKind, GroupMembership, LifecycleEvent, Message, SenderKind, SkillGroup,
    TenantSettings,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ConversationStore, MessageCursor, NewConversation, NewMessage};

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<Message>,
    events: Vec<LifecycleEvent>,
    read_cursors: HashMap<(Uuid, Uuid, Uuid), (Uuid, OffsetDateTime)>,
    profiles: HashMap<(Uuid, Uuid), AgentProfile>,
    groups: HashMap<Uuid, SkillGroup>,
    memberships: Vec<GroupMembership>,
    cursors: HashMap<(Uuid, String), Uuid>,
    attachments: HashMap<Uuid, AttachmentMeta>,
    site_origins: HashMap<(Uuid, Uuid), Vec<String>>,
    settings: HashMap<Uuid, TenantSettings>,
    tenants: BTreeSet<Uuid>,
}

impl State {
    fn active_count(&self, tenant_id: Uuid, agent: Uuid) -> i64 {
        self.conversations
            .values()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.status == ConversationStatus::Assigned
                    && c.assigned_agent_id == Some(agent)
            })
            .count() as i64
    }

    fn customer_activity_at(conversation: &Conversation) -> OffsetDateTime {
        conversation
            .last_customer_msg_at
            .unwrap_or(conversation.created_at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding helpers (profiles, groups, and collaborator data are CRUD
    //    owned by excluded components; deployments seed them externally) ----

    pub async fn put_agent_profile(&self, profile: AgentProfile) {
        let mut state = self.state.lock().await;
        state.tenants.insert(profile.tenant_id);
        state
            .profiles
            .insert((profile.tenant_id, profile.user_id), profile);
    }

    pub async fn put_group(&self, group: SkillGroup) {
        let mut state = self.state.lock().await;
        state.groups.insert(group.id, group);
    }

    pub async fn put_membership(&self, membership: GroupMembership) {
        let mut state = self.state.lock().await;
        state
            .memberships
            .retain(|m| !(m.group_id == membership.group_id && m.agent_user_id == membership.agent_user_id));
        state.memberships.push(membership);
    }

    pub async fn put_attachment(&self, meta: AttachmentMeta) {
        let mut state = self.state.lock().await;
        state.attachments.insert(meta.id, meta);
    }

    pub async fn put_site_origins(&self, tenant_id: Uuid, site_id: Uuid, origins: Vec<String>) {
        let mut state = self.state.lock().await;
        state.site_origins.insert((tenant_id, site_id), origins);
    }

    pub async fn put_tenant_settings(&self, tenant_id: Uuid, settings: TenantSettings) {
        let mut state = self.state.lock().await;
        state.tenants.insert(tenant_id);
        state.settings.insert(tenant_id, settings);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert_conversation(&self, new: NewConversation) -> CoreResult<Conversation> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            customer_ref: new.customer_ref,
            assigned_agent_id: None,
            skill_group_id: new.skill_group_id,
            status: ConversationStatus::Queued,
            site_id: new.site_id,
            visitor_id: new.visitor_id,
            created_at: now,
            last_msg_at: now,
            last_customer_msg_at: None,
            last_idle_event_at: None,
            closed_at: None,
            archived_reason: None,
        };
        state.tenants.insert(new.tenant_id);
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn conversation(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<Option<Conversation>> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn assign_if_unassigned(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(max) = state
            .profiles
            .get(&(tenant_id, agent))
            .map(|p| p.max_concurrent as i64)
        else {
            return Ok(false);
        };
        if state.active_count(tenant_id, agent) >= max {
            return Ok(false);
        }
        match state.conversations.get_mut(&id) {
            Some(c)
                if c.tenant_id == tenant_id
                    && c.status == ConversationStatus::Queued
                    && c.assigned_agent_id.is_none() =>
            {
                c.status = ConversationStatus::Assigned;
                c.assigned_agent_id = Some(agent);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn assign_if_unassigned_or_self(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c)
                if c.tenant_id == tenant_id
                    && c.status != ConversationStatus::Closed
                    && (c.assigned_agent_id.is_none() || c.assigned_agent_id == Some(agent)) =>
            {
                c.status = ConversationStatus::Assigned;
                c.assigned_agent_id = Some(agent);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn assign_override(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<Option<Option<Uuid>>> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c) if c.tenant_id == tenant_id => {
                let previous = c.assigned_agent_id;
                c.status = ConversationStatus::Assigned;
                c.assigned_agent_id = Some(agent);
                c.closed_at = None;
                c.archived_reason = None;
                Ok(Some(previous))
            }
            _ => Ok(None),
        }
    }

    async fn close_if_open(&self, tenant_id: Uuid, id: Uuid, reason: &str) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c) if c.tenant_id == tenant_id && c.status != ConversationStatus::Closed => {
                c.status = ConversationStatus::Closed;
                c.closed_at = Some(OffsetDateTime::now_utc());
                c.archived_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reopen_to_agent_if_closed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c) if c.tenant_id == tenant_id && c.status == ConversationStatus::Closed => {
                c.status = ConversationStatus::Assigned;
                c.assigned_agent_id = Some(agent);
                c.closed_at = None;
                c.archived_reason = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reopen_to_queued_if_closed(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c) if c.tenant_id == tenant_id && c.status == ConversationStatus::Closed => {
                c.status = ConversationStatus::Queued;
                c.assigned_agent_id = None;
                c.closed_at = None;
                c.archived_reason = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unassign_if_assigned_to(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c)
                if c.tenant_id == tenant_id
                    && c.status == ConversationStatus::Assigned
                    && c.assigned_agent_id == Some(agent) =>
            {
                c.status = ConversationStatus::Queued;
                c.assigned_agent_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_last_msg(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: OffsetDateTime,
        customer: bool,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(c) = state.conversations.get_mut(&id) {
            if c.tenant_id == tenant_id {
                if at > c.last_msg_at {
                    c.last_msg_at = at;
                }
                if customer {
                    c.last_customer_msg_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn mark_idle_event_fired(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: OffsetDateTime,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.conversations.get_mut(&id) {
            Some(c) if c.tenant_id == tenant_id => {
                let activity = Self::customer_activity(c);
                let eligible = c.last_idle_event_at.is_none_or(|fired| fired < activity);
                if eligible {
                    c.last_idle_event_at = Some(at);
                }
                Ok(eligible)
            }
            _ => Ok(false),
        }
    }

    async fn queued_oldest_first(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut queued: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.status == ConversationStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|c| (c.created_at, c.id));
        queued.truncate(limit.max(0) as usize);
        Ok(queued)
    }

    async fn queued_visible_to_agent(
        &self,
        tenant_id: Uuid,
        agent: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut queued: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.status == ConversationStatus::Queued)
            .filter(|c| match c.skill_group_id {
                None => true,
                Some(group) => state
                    .memberships
                    .iter()
                    .any(|m| m.group_id == group && m.agent_user_id == agent),
            })
            .cloned()
            .collect();
        queued.sort_by_key(|c| (c.created_at, c.id));
        queued.truncate(limit.max(0) as usize);
        Ok(queued)
    }

    async fn idle_candidates(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut hits: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.status != ConversationStatus::Closed)
            .filter(|c| {
                let activity = State::customer_activity_at(c);
                activity < cutoff && c.last_idle_event_at.is_none_or(|fired| fired < activity)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|c| (c.created_at, c.id));
        Ok(hits)
    }

    async fn inactive_open(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut hits: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.status != ConversationStatus::Closed
                    && c.last_msg_at < cutoff
            })
            .cloned()
            .collect();
        hits.sort_by_key(|c| (c.created_at, c.id));
        Ok(hits)
    }

    async fn no_reply_candidates(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut hits: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.status == ConversationStatus::Assigned)
            .filter(|c| match c.last_customer_msg_at {
                Some(at) if at < cutoff => !state.messages.iter().any(|m| {
                    m.conversation_id == c.id
                        && m.sender_kind == SenderKind::Agent
                        && m.created_at > at
                }),
                _ => false,
            })
            .cloned()
            .collect();
        hits.sort_by_key(|c| (c.created_at, c.id));
        Ok(hits)
    }

    async fn agent_profile(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<Option<AgentProfile>> {
        let state = self.state.lock().await;
        Ok(state.profiles.get(&(tenant_id, user_id)).cloned())
    }

    async fn upsert_agent_status(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        status: AgentStatus,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.tenants.insert(tenant_id);
        state
            .profiles
            .entry((tenant_id, user_id))
            .and_modify(|p| p.status = status)
            .or_insert(AgentProfile {
                user_id,
                tenant_id,
                status,
                max_concurrent: 3,
            });
        Ok(())
    }

    async fn active_assigned_count(&self, tenant_id: Uuid, agent: Uuid) -> CoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state.active_count(tenant_id, agent))
    }

    async fn group_members(
        &self,
        tenant_id: Uuid,
        group_id: Uuid,
    ) -> CoreResult<Vec<GroupMembership>> {
        let state = self.state.lock().await;
        let enabled = state
            .groups
            .get(&group_id)
            .is_some_and(|g| g.tenant_id == tenant_id && g.enabled);
        if !enabled {
            return Ok(Vec::new());
        }
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn staff_agents(&self, tenant_id: Uuid) -> CoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut users: Vec<Uuid> = state
            .profiles
            .keys()
            .filter(|(t, _)| *t == tenant_id)
            .map(|(_, u)| *u)
            .collect();
        users.sort();
        Ok(users)
    }

    async fn candidates_for(
        &self,
        tenant_id: Uuid,
        users: &[(Uuid, i32)],
    ) -> CoreResult<Vec<Candidate>> {
        let state = self.state.lock().await;
        Ok(users
            .iter()
            .filter_map(|(user_id, weight)| {
                let profile = state.profiles.get(&(tenant_id, *user_id))?;
                if profile.status != AgentStatus::Online {
                    return None;
                }
                Some(Candidate {
                    user_id: *user_id,
                    weight: *weight,
                    max_concurrent: profile.max_concurrent,
                    active_count: state.active_count(tenant_id, *user_id),
                })
            })
            .collect())
    }

    async fn ensure_fallback_group(&self, tenant_id: Uuid) -> CoreResult<SkillGroup> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .groups
            .values()
            .find(|g| g.tenant_id == tenant_id && g.is_fallback)
        {
            return Ok(existing.clone());
        }
        let group = SkillGroup {
            id: Uuid::new_v4(),
            tenant_id,
            name: "General".to_string(),
            enabled: true,
            is_fallback: true,
        };
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn enroll_in_fallback(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        let group = self.ensure_fallback_group(tenant_id).await?;
        let mut state = self.state.lock().await;
        let already = state
            .memberships
            .iter()
            .any(|m| m.group_id == group.id && m.agent_user_id == user_id);
        if !already {
            state.memberships.push(GroupMembership {
                group_id: group.id,
                agent_user_id: user_id,
                weight: 0,
            });
        }
        Ok(())
    }

    async fn cursor_last(&self, tenant_id: Uuid, group_key: &str) -> CoreResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state.cursors.get(&(tenant_id, group_key.to_string())).copied())
    }

    async fn cursor_set(&self, tenant_id: Uuid, group_key: &str, agent: Uuid) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.cursors.insert((tenant_id, group_key.to_string()), agent);
        Ok(())
    }

    async fn insert_message(&self, new: NewMessage) -> CoreResult<(Message, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.messages.iter().find(|m| {
            m.tenant_id == new.tenant_id
                && m.sender_id == new.sender_id
                && m.client_msg_id == new.client_msg_id
        }) {
            return Ok((existing.clone(), false));
        }
        let message = Message {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            conversation_id: new.conversation_id,
            sender_kind: new.sender_kind,
            sender_id: new.sender_id,
            client_msg_id: new.client_msg_id,
            kind: new.kind,
            body: new.body,
            attachment_id: new.attachment_id,
            created_at: OffsetDateTime::now_utc(),
        };
        state.messages.push(message.clone());
        Ok((message, true))
    }

    async fn message(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<Option<Message>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .find(|m| m.tenant_id == tenant_id && m.id == id)
            .cloned())
    }

    async fn messages_page(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> CoreResult<Vec<Message>> {
        let state = self.state.lock().await;
        let mut page: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.conversation_id == conversation_id)
            .filter(|m| match after {
                Some(cursor) => (m.created_at, m.id) > (cursor.created_at, cursor.id),
                None => true,
            })
            .cloned()
            .collect();
        page.sort_by_key(|m| (m.created_at, m.id));
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }

    async fn upsert_read_cursor(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_msg_id: Uuid,
    ) -> CoreResult<OffsetDateTime> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        state
            .read_cursors
            .insert((tenant_id, conversation_id, user_id), (last_read_msg_id, now));
        Ok(now)
    }

    async fn insert_event(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> CoreResult<LifecycleEvent> {
        let mut state = self.state.lock().await;
        let event = LifecycleEvent {
            id: Uuid::new_v4(),
            tenant_id,
            conversation_id,
            kind,
            payload,
            created_at: OffsetDateTime::now_utc(),
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn events_for(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<LifecycleEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<LifecycleEvent> = state
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.conversation_id == conversation_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn attachment_meta(
        &self,
        tenant_id: Uuid,
        attachment_id: Uuid,
    ) -> CoreResult<Option<AttachmentMeta>> {
        let state = self.state.lock().await;
        Ok(state
            .attachments
            .get(&attachment_id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn site_allowed_origins(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
    ) -> CoreResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .site_origins
            .get(&(tenant_id, site_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_active_tenants(&self) -> CoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state.tenants.iter().copied().collect())
    }

    async fn tenant_settings(&self, tenant_id: Uuid) -> CoreResult<Option<TenantSettings>> {
        let state = self.state.lock().await;
        Ok(state.settings.get(&tenant_id).copied())
    }
}

impl MemoryStore {
    fn customer_activity(conversation: &Conversation) -> OffsetDateTime {
        State::customer_activity_at(conversation)
    }
}
