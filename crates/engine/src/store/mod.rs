//! Conversation state storage interface
//!
//! The only mutation path for conversation, message, and agent rows. Every
//! state transition is expressed as a conditional operation that reports
//! whether it applied, so racing writers converge without long-lived
//! transactions: the loser of a compare-and-swap simply observes `false`.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chatwire_shared::{
    AgentProfile, AgentStatus, AttachmentMeta, Candidate, Conversation, CoreResult, EventKind,
    GroupMembership, LifecycleEvent, Message, MessageKind, SenderKind, SkillGroup, TenantSettings,
};
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Fields for a new conversation row. Inserted as `queued`.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub tenant_id: Uuid,
    pub customer_ref: Option<String>,
    pub skill_group_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub visitor_id: Option<Uuid>,
}

/// Fields for a message insert. `(tenant_id, sender_id, client_msg_id)` is
/// the idempotency key.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_kind: SenderKind,
    pub sender_id: Uuid,
    pub client_msg_id: String,
    pub kind: MessageKind,
    pub body: String,
    pub attachment_id: Option<Uuid>,
}

/// Pagination cursor: position of the last message already seen.
#[derive(Debug, Clone, Copy)]
pub struct MessageCursor {
    pub created_at: OffsetDateTime,
    pub id: Uuid,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    // -- conversations ------------------------------------------------------

    async fn insert_conversation(&self, new: NewConversation) -> CoreResult<Conversation>;

    async fn conversation(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<Option<Conversation>>;

    /// CAS: assign only while still unassigned AND the agent is below
    /// `max_concurrent`. The capacity check lives inside the same operation
    /// so racing assigns cannot overload an agent.
    async fn assign_if_unassigned(&self, tenant_id: Uuid, id: Uuid, agent: Uuid)
        -> CoreResult<bool>;

    /// CAS used by `claim`: applies when unassigned or already assigned to
    /// the claiming agent.
    async fn assign_if_unassigned_or_self(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool>;

    /// Unconditional override. Returns `None` if the conversation does not
    /// exist, otherwise the previous assignee.
    async fn assign_override(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<Option<Option<Uuid>>>;

    /// Idempotent close: applies only while not already closed.
    async fn close_if_open(&self, tenant_id: Uuid, id: Uuid, reason: &str) -> CoreResult<bool>;

    /// `closed -> assigned` to the reopening agent.
    async fn reopen_to_agent_if_closed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool>;

    /// `closed -> queued`, clearing any prior assignment. Zero rows affected
    /// means a concurrent caller already reopened it.
    async fn reopen_to_queued_if_closed(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<bool>;

    /// Tentative unassign for no-reply transfer, conditional on the expected
    /// current assignee.
    async fn unassign_if_assigned_to(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        agent: Uuid,
    ) -> CoreResult<bool>;

    /// Advance activity timestamps. `last_msg_at` is monotonic.
    async fn touch_last_msg(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: OffsetDateTime,
        customer: bool,
    ) -> CoreResult<()>;

    /// Stamp `last_idle_event_at`, conditional on no idle event having fired
    /// for the current inactivity window (compared against customer
    /// activity, not wall clock).
    async fn mark_idle_event_fired(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: OffsetDateTime,
    ) -> CoreResult<bool>;

    // -- queue and scheduler scans -----------------------------------------

    async fn queued_oldest_first(&self, tenant_id: Uuid, limit: i64)
        -> CoreResult<Vec<Conversation>>;

    /// Queued conversations visible to one agent: global-pool rows plus rows
    /// targeted at a skill group the agent belongs to.
    async fn queued_visible_to_agent(
        &self,
        tenant_id: Uuid,
        agent: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<Conversation>>;

    /// Open conversations whose last customer activity precedes `cutoff` and
    /// whose current inactivity window has not fired an idle event yet.
    async fn idle_candidates(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>>;

    /// Open conversations with no traffic at all since `cutoff`.
    async fn inactive_open(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>>;

    /// Assigned conversations where the customer wrote before `cutoff` and
    /// no agent reply followed.
    async fn no_reply_candidates(
        &self,
        tenant_id: Uuid,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<Conversation>>;

    // -- agents and groups --------------------------------------------------

    async fn agent_profile(&self, tenant_id: Uuid, user_id: Uuid)
        -> CoreResult<Option<AgentProfile>>;

    async fn upsert_agent_status(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        status: AgentStatus,
    ) -> CoreResult<()>;

    async fn active_assigned_count(&self, tenant_id: Uuid, agent: Uuid) -> CoreResult<i64>;

    /// Memberships of an enabled group. Disabled or missing groups yield an
    /// empty list (the caller falls back to the tenant pool).
    async fn group_members(&self, tenant_id: Uuid, group_id: Uuid)
        -> CoreResult<Vec<GroupMembership>>;

    /// All staff user ids of the tenant (the tenant-wide pool).
    async fn staff_agents(&self, tenant_id: Uuid) -> CoreResult<Vec<Uuid>>;

    /// Load assignment candidates for the given `(user, weight)` pairs:
    /// only agents whose stored status is `online`, with their current
    /// active assigned counts.
    async fn candidates_for(
        &self,
        tenant_id: Uuid,
        users: &[(Uuid, i32)],
    ) -> CoreResult<Vec<Candidate>>;

    /// Lazily create the tenant's system fallback group.
    async fn ensure_fallback_group(&self, tenant_id: Uuid) -> CoreResult<SkillGroup>;

    /// Auto-enrol a staff member into the fallback group. Idempotent.
    async fn enroll_in_fallback(&self, tenant_id: Uuid, user_id: Uuid) -> CoreResult<()>;

    // -- fairness cursor ----------------------------------------------------

    async fn cursor_last(&self, tenant_id: Uuid, group_key: &str) -> CoreResult<Option<Uuid>>;

    async fn cursor_set(&self, tenant_id: Uuid, group_key: &str, agent: Uuid) -> CoreResult<()>;

    // -- messages -----------------------------------------------------------

    /// Insert-or-return-existing keyed by `(tenant, sender, client_msg_id)`.
    /// The bool is `true` only for a fresh insert.
    async fn insert_message(&self, new: NewMessage) -> CoreResult<(Message, bool)>;

    async fn message(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<Option<Message>>;

    /// Page ordered by `(created_at, id)` ascending, strictly after the
    /// cursor when given.
    async fn messages_page(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> CoreResult<Vec<Message>>;

    /// Upsert the per-user read cursor; returns the update timestamp.
    async fn upsert_read_cursor(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_msg_id: Uuid,
    ) -> CoreResult<OffsetDateTime>;

    // -- lifecycle events ---------------------------------------------------

    async fn insert_event(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> CoreResult<LifecycleEvent>;

    async fn events_for(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<LifecycleEvent>>;

    // -- collaborator lookups ----------------------------------------------

    async fn attachment_meta(
        &self,
        tenant_id: Uuid,
        attachment_id: Uuid,
    ) -> CoreResult<Option<AttachmentMeta>>;

    /// Origins allowed to open visitor connections for a site.
    async fn site_allowed_origins(&self, tenant_id: Uuid, site_id: Uuid)
        -> CoreResult<Vec<String>>;

    // -- tenants ------------------------------------------------------------

    async fn list_active_tenants(&self) -> CoreResult<Vec<Uuid>>;

    /// Stored per-tenant settings, if any. Callers apply defaults and
    /// clamping.
    async fn tenant_settings(&self, tenant_id: Uuid) -> CoreResult<Option<TenantSettings>>;
}
