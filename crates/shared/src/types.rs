//! Domain types shared across the chatwire platform
//!
//! Conversations, messages, agents, skill groups, assignment cursors,
//! lifecycle events, and authenticated claims. Status enums serialize as
//! snake_case on the wire and as TEXT in storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Sentinel cursor key for the tenant-wide routing pool (no skill group).
pub const DEFAULT_GROUP_KEY: &str = "__default__";

/// Thresholds are clamped to [1 minute, 1 year].
pub const MIN_THRESHOLD_MINUTES: i64 = 1;
pub const MAX_THRESHOLD_MINUTES: i64 = 525_600;

// =============================================================================
// Status enums
// =============================================================================

/// Conversation lifecycle status (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Queued,
    Assigned,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Queued => "queued",
            ConversationStatus::Assigned => "assigned",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ConversationStatus::Queued),
            "assigned" => Some(ConversationStatus::Assigned),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }
}

/// Stored agent availability preference, independent of liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Away,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Away => "away",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(AgentStatus::Online),
            "away" => Some(AgentStatus::Away),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

/// Derived presentation of agent availability. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Online,
    Away,
    Offline,
    Busy,
}

impl EffectiveStatus {
    /// `busy` iff online with zero remaining capacity; `offline` whenever
    /// there is no live session regardless of the stored preference.
    pub fn derive(stored: AgentStatus, has_active_session: bool, remaining_capacity: i64) -> Self {
        if !has_active_session {
            return EffectiveStatus::Offline;
        }
        match stored {
            AgentStatus::Online if remaining_capacity == 0 => EffectiveStatus::Busy,
            AgentStatus::Online => EffectiveStatus::Online,
            AgentStatus::Away => EffectiveStatus::Away,
            AgentStatus::Offline => EffectiveStatus::Offline,
        }
    }
}

/// Caller role carried in verified claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Agent,
    Customer,
    Visitor,
}

impl Role {
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Admin | Role::Agent)
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Agent,
    Customer,
    Visitor,
    System,
}

impl SenderKind {
    /// Customer-side traffic reopens closed conversations
    pub fn is_customer_side(&self) -> bool {
        matches!(self, SenderKind::Customer | SenderKind::Visitor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SenderKind::Agent => "agent",
            SenderKind::Customer => "customer",
            SenderKind::Visitor => "visitor",
            SenderKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(SenderKind::Agent),
            "customer" => Some(SenderKind::Customer),
            "visitor" => Some(SenderKind::Visitor),
            "system" => Some(SenderKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

/// Persisted, broadcastable conversation state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Assigned,
    Claimed,
    Transferred,
    Archived,
    Reopened,
    Idle,
    PageView,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Assigned => "assigned",
            EventKind::Claimed => "claimed",
            EventKind::Transferred => "transferred",
            EventKind::Archived => "archived",
            EventKind::Reopened => "reopened",
            EventKind::Idle => "idle",
            EventKind::PageView => "page_view",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(EventKind::Started),
            "assigned" => Some(EventKind::Assigned),
            "claimed" => Some(EventKind::Claimed),
            "transferred" => Some(EventKind::Transferred),
            "archived" => Some(EventKind::Archived),
            "reopened" => Some(EventKind::Reopened),
            "idle" => Some(EventKind::Idle),
            "page_view" => Some(EventKind::PageView),
            _ => None,
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_ref: Option<String>,
    pub assigned_agent_id: Option<Uuid>,
    pub skill_group_id: Option<Uuid>,
    pub status: ConversationStatus,
    pub site_id: Option<Uuid>,
    pub visitor_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_msg_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_customer_msg_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_idle_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    pub archived_reason: Option<String>,
}

impl Conversation {
    pub fn is_open(&self) -> bool {
        self.status != ConversationStatus::Closed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_kind: SenderKind,
    pub sender_id: Uuid,
    pub client_msg_id: String,
    pub kind: MessageKind,
    pub body: String,
    pub attachment_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadCursor {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_read_msg_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Durable agent preference state, independent of liveness
#[derive(Debug, Clone, Serialize)]
pub struct AgentProfile {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub status: AgentStatus,
    pub max_concurrent: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillGroup {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMembership {
    pub group_id: Uuid,
    pub agent_user_id: Uuid,
    pub weight: i32,
}

/// Per-(tenant, pool) round-robin pointer
#[derive(Debug, Clone)]
pub struct AssignmentCursor {
    pub tenant_id: Uuid,
    pub group_key: String,
    pub last_agent_user_id: Option<Uuid>,
}

/// Assignment pool entry: an online agent with its current load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub user_id: Uuid,
    pub weight: i32,
    pub max_concurrent: i32,
    pub active_count: i64,
}

impl Candidate {
    pub fn remaining_capacity(&self) -> i64 {
        (self.max_concurrent as i64 - self.active_count).max(0)
    }
}

/// Attachment metadata resolved from the storage service
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentMeta {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
}

/// Verified identity claims. Issued and verified by an external collaborator;
/// the core treats this as trusted input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: Role,
    pub site_id: Option<Uuid>,
}

/// Per-tenant scheduler thresholds, clamped to [1 minute, 1 year]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub idle_after_minutes: i64,
    pub archive_after_minutes: i64,
    pub no_reply_after_minutes: i64,
    pub queue_drain_batch: i64,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            idle_after_minutes: 5,
            archive_after_minutes: 1440,
            no_reply_after_minutes: 10,
            queue_drain_batch: 50,
        }
    }
}

impl TenantSettings {
    /// Clamp all thresholds into the supported range.
    pub fn clamped(mut self) -> Self {
        self.idle_after_minutes = self
            .idle_after_minutes
            .clamp(MIN_THRESHOLD_MINUTES, MAX_THRESHOLD_MINUTES);
        self.archive_after_minutes = self
            .archive_after_minutes
            .clamp(MIN_THRESHOLD_MINUTES, MAX_THRESHOLD_MINUTES);
        self.no_reply_after_minutes = self
            .no_reply_after_minutes
            .clamp(MIN_THRESHOLD_MINUTES, MAX_THRESHOLD_MINUTES);
        self.queue_drain_batch = self.queue_drain_batch.clamp(1, 500);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in ["queued", "assigned", "closed"] {
            let parsed = ConversationStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(ConversationStatus::parse("open").is_none());
    }

    #[test]
    fn test_effective_status_derivation() {
        // No session wins over everything
        assert_eq!(
            EffectiveStatus::derive(AgentStatus::Online, false, 3),
            EffectiveStatus::Offline
        );
        // Online at capacity is busy
        assert_eq!(
            EffectiveStatus::derive(AgentStatus::Online, true, 0),
            EffectiveStatus::Busy
        );
        assert_eq!(
            EffectiveStatus::derive(AgentStatus::Online, true, 2),
            EffectiveStatus::Online
        );
        // Away is never busy
        assert_eq!(
            EffectiveStatus::derive(AgentStatus::Away, true, 0),
            EffectiveStatus::Away
        );
    }

    #[test]
    fn test_settings_clamped() {
        let settings = TenantSettings {
            idle_after_minutes: 0,
            archive_after_minutes: 10_000_000,
            no_reply_after_minutes: 15,
            queue_drain_batch: 0,
        }
        .clamped();
        assert_eq!(settings.idle_after_minutes, MIN_THRESHOLD_MINUTES);
        assert_eq!(settings.archive_after_minutes, MAX_THRESHOLD_MINUTES);
        assert_eq!(settings.no_reply_after_minutes, 15);
        assert_eq!(settings.queue_drain_batch, 1);
    }

    #[test]
    fn test_candidate_remaining_capacity() {
        let c = Candidate {
            user_id: Uuid::new_v4(),
            weight: 0,
            max_concurrent: 2,
            active_count: 3,
        };
        // Over-assigned agents never report negative capacity
        assert_eq!(c.remaining_capacity(), 0);
    }

    #[test]
    fn test_role_staff() {
        assert!(Role::Admin.is_staff());
        assert!(Role::Agent.is_staff());
        assert!(!Role::Customer.is_staff());
        assert!(!Role::Visitor.is_staff());
    }
}
