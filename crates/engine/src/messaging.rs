//! Messaging pipeline
//!
//! Validates, authorizes, and persists messages, handling the customer-side
//! reopen of closed conversations and duplicate submissions along the way.
//! Delivery acknowledgement is keyed by the sender's `client_msg_id`:
//! resending the same id returns the original message instead of a
//! duplicate.

use async_trait::async_trait;
use chatwire_shared::{
    Claims, CoreError, CoreResult, Message, MessageKind, ReadCursor, Role, SenderKind,
};
use uuid::Uuid;

use crate::lifecycle::participant_owns;
use crate::store::{MessageCursor, NewMessage};
use crate::Engine;

const MAX_BODY_LEN: usize = 8000;
const MAX_PAGE_SIZE: i64 = 200;

/// Signal from the session hub that a staff member currently has the
/// conversation open. Engaged staff may write without holding the
/// assignment (supervisors shadowing a chat).
#[async_trait]
pub trait Engagement: Send + Sync {
    async fn is_engaged(&self, tenant_id: Uuid, conversation_id: Uuid, user_id: Uuid) -> bool;
}

/// No hub attached: only assignees and admins may write as staff.
pub struct NoEngagement;

#[async_trait]
impl Engagement for NoEngagement {
    async fn is_engaged(&self, _tenant_id: Uuid, _conversation_id: Uuid, _user_id: Uuid) -> bool {
        false
    }
}

/// A message submission from any channel (WS frame or REST body).
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub conversation_id: Uuid,
    pub client_msg_id: String,
    pub kind: MessageKind,
    pub body: String,
    pub attachment_id: Option<Uuid>,
}

/// What happened to a submission: `inserted` is false for duplicates,
/// `reopened` is true when customer traffic revived a closed conversation.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub inserted: bool,
    pub reopened: bool,
}

/// One page of history plus whether a dangling cursor forced a restart
/// from the beginning.
#[derive(Debug, Clone)]
pub struct MessagesPage {
    pub messages: Vec<Message>,
    pub reset: bool,
}

impl Engine {
    pub async fn send_message(&self, claims: &Claims, send: SendMessage) -> CoreResult<SendOutcome> {
        if send.client_msg_id.trim().is_empty() {
            return Err(CoreError::Validation("client_msg_id is required".into()));
        }
        if send.body.trim().is_empty() && send.kind == MessageKind::Text {
            return Err(CoreError::Validation("message body is empty".into()));
        }
        if send.body.len() > MAX_BODY_LEN {
            return Err(CoreError::Validation(format!(
                "message body exceeds {MAX_BODY_LEN} bytes"
            )));
        }

        let conversation = self
            .store
            .conversation(claims.tenant_id, send.conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;

        let sender_kind = sender_kind_for(claims.role);
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }
        if claims.role == Role::Agent
            && conversation.assigned_agent_id != Some(claims.user_id)
            && !self
                .engagement
                .is_engaged(claims.tenant_id, send.conversation_id, claims.user_id)
                .await
        {
            return Err(CoreError::Forbidden);
        }

        if send.kind == MessageKind::File {
            let attachment_id = send
                .attachment_id
                .ok_or_else(|| CoreError::Validation("file message without attachment".into()))?;
            if self
                .store
                .attachment_meta(claims.tenant_id, attachment_id)
                .await?
                .is_none()
            {
                return Err(CoreError::AttachmentNotFound);
            }
        }

        let mut reopened = false;
        if !conversation.is_open() {
            if sender_kind.is_customer_side() {
                // Revive and retry placement before accepting the message.
                // Losing the reopen race just means someone else revived it.
                self.reopen_to_queued(claims.tenant_id, send.conversation_id)
                    .await?;
                reopened = true;
            } else {
                return Err(CoreError::ConversationClosed);
            }
        }

        let (message, inserted) = self
            .store
            .insert_message(NewMessage {
                tenant_id: claims.tenant_id,
                conversation_id: send.conversation_id,
                sender_kind,
                sender_id: claims.user_id,
                client_msg_id: send.client_msg_id,
                kind: send.kind,
                body: send.body,
                attachment_id: send.attachment_id,
            })
            .await?;

        // Duplicates must not move the activity clock
        if inserted {
            self.store
                .touch_last_msg(
                    claims.tenant_id,
                    send.conversation_id,
                    message.created_at,
                    sender_kind.is_customer_side(),
                )
                .await?;
        }

        Ok(SendOutcome {
            message,
            inserted,
            reopened,
        })
    }

    /// Advance the caller's read cursor to `message_id`, which must belong
    /// to the conversation.
    pub async fn mark_read(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> CoreResult<ReadCursor> {
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }

        let message = self
            .store
            .message(claims.tenant_id, message_id)
            .await?
            .ok_or(CoreError::MessageNotFound)?;
        if message.conversation_id != conversation_id {
            return Err(CoreError::Validation(
                "message belongs to another conversation".into(),
            ));
        }

        let updated_at = self
            .store
            .upsert_read_cursor(claims.tenant_id, conversation_id, claims.user_id, message_id)
            .await?;
        Ok(ReadCursor {
            tenant_id: claims.tenant_id,
            conversation_id,
            user_id: claims.user_id,
            last_read_msg_id: message_id,
            updated_at,
        })
    }

    /// History page ordered oldest-first, strictly after `after_msg_id`. A
    /// cursor pointing at a vanished message restarts from the beginning
    /// with `reset` set instead of failing the sync.
    pub async fn list_messages(
        &self,
        claims: &Claims,
        conversation_id: Uuid,
        after_msg_id: Option<Uuid>,
        limit: i64,
    ) -> CoreResult<MessagesPage> {
        let conversation = self
            .store
            .conversation(claims.tenant_id, conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound)?;
        if !claims.role.is_staff() && !participant_owns(claims, &conversation) {
            return Err(CoreError::Forbidden);
        }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let (after, reset) = match after_msg_id {
            None => (None, false),
            Some(id) => match self.store.message(claims.tenant_id, id).await? {
                Some(m) if m.conversation_id == conversation_id => (
                    Some(MessageCursor {
                        created_at: m.created_at,
                        id: m.id,
                    }),
                    false,
                ),
                _ => (None, true),
            },
        };

        let messages = self
            .store
            .messages_page(claims.tenant_id, conversation_id, after, limit)
            .await?;
        Ok(MessagesPage { messages, reset })
    }
}

fn sender_kind_for(role: Role) -> SenderKind {
    match role {
        Role::Admin | Role::Agent => SenderKind::Agent,
        Role::Customer => SenderKind::Customer,
        Role::Visitor => SenderKind::Visitor,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatwire_shared::{AgentProfile, AgentStatus, AttachmentMeta, ConversationStatus};

    use super::*;
    use crate::lock::MemoryLock;
    use crate::presence::MemoryPresence;
    use crate::store::{ConversationStore, MemoryStore, NewConversation};

    fn harness() -> (Arc<MemoryStore>, Engine) {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(
            store.clone(),
            Arc::new(MemoryPresence::new(Duration::from_secs(30))),
            Arc::new(MemoryLock::new()),
        );
        (store, engine)
    }

    fn claims(tenant: Uuid, user: Uuid, role: Role) -> Claims {
        Claims {
            user_id: user,
            tenant_id: tenant,
            role,
            site_id: None,
        }
    }

    fn text(conversation_id: Uuid, client_msg_id: &str, body: &str) -> SendMessage {
        SendMessage {
            conversation_id,
            client_msg_id: client_msg_id.to_string(),
            kind: MessageKind::Text,
            body: body.to_string(),
            attachment_id: None,
        }
    }

    async fn visitor_conversation(store: &MemoryStore, tenant: Uuid, visitor: Uuid) -> Uuid {
        store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: None,
                skill_group_id: None,
                site_id: None,
                visitor_id: Some(visitor),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_duplicate_send_returns_original() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let visitor = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, visitor).await;
        let caller = claims(tenant, visitor, Role::Visitor);

        let first = engine
            .send_message(&caller, text(conv, "c-1", "hello"))
            .await
            .unwrap();
        assert!(first.inserted);

        let second = engine
            .send_message(&caller, text(conv, "c-1", "hello"))
            .await
            .unwrap();
        assert!(!second.inserted);
        assert_eq!(second.message.id, first.message.id);
    }

    #[tokio::test]
    async fn test_visitor_message_reopens_closed_conversation() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let visitor = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, visitor).await;
        store.close_if_open(tenant, conv, "resolved").await.unwrap();

        let caller = claims(tenant, visitor, Role::Visitor);
        let outcome = engine
            .send_message(&caller, text(conv, "c-1", "are you still there?"))
            .await
            .unwrap();
        assert!(outcome.reopened);

        let revived = store.conversation(tenant, conv).await.unwrap().unwrap();
        assert_ne!(revived.status, ConversationStatus::Closed);
        assert!(revived.closed_at.is_none());
    }

    #[tokio::test]
    async fn test_staff_message_on_closed_conversation_is_rejected() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, Uuid::new_v4()).await;
        store.close_if_open(tenant, conv, "resolved").await.unwrap();

        let admin = claims(tenant, Uuid::new_v4(), Role::Admin);
        assert!(matches!(
            engine.send_message(&admin, text(conv, "c-1", "hi")).await,
            Err(CoreError::ConversationClosed)
        ));
    }

    #[tokio::test]
    async fn test_agent_needs_assignment_or_engagement() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, Uuid::new_v4()).await;

        let assignee = Uuid::new_v4();
        store.put_agent_profile(AgentProfile {
            user_id: assignee,
            tenant_id: tenant,
            status: AgentStatus::Online,
            max_concurrent: 3,
        }).await;
        store.assign_if_unassigned(tenant, conv, assignee).await.unwrap();

        let outsider = claims(tenant, Uuid::new_v4(), Role::Agent);
        assert!(matches!(
            engine.send_message(&outsider, text(conv, "c-1", "hi")).await,
            Err(CoreError::Forbidden)
        ));

        let holder = claims(tenant, assignee, Role::Agent);
        assert!(engine
            .send_message(&holder, text(conv, "c-2", "hi"))
            .await
            .unwrap()
            .inserted);

        // Admins pass regardless of assignment
        let admin = claims(tenant, Uuid::new_v4(), Role::Admin);
        assert!(engine
            .send_message(&admin, text(conv, "c-3", "supervising"))
            .await
            .unwrap()
            .inserted);
    }

    #[tokio::test]
    async fn test_visitor_cannot_write_to_foreign_conversation() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, Uuid::new_v4()).await;

        let stranger = claims(tenant, Uuid::new_v4(), Role::Visitor);
        assert!(matches!(
            engine.send_message(&stranger, text(conv, "c-1", "hi")).await,
            Err(CoreError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_empty_body_rejected() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let visitor = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, visitor).await;
        let caller = claims(tenant, visitor, Role::Visitor);

        assert!(matches!(
            engine.send_message(&caller, text(conv, "c-1", "   ")).await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_file_message_requires_known_attachment() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let visitor = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, visitor).await;
        let caller = claims(tenant, visitor, Role::Visitor);

        let missing = SendMessage {
            conversation_id: conv,
            client_msg_id: "c-1".into(),
            kind: MessageKind::File,
            body: "report.pdf".into(),
            attachment_id: Some(Uuid::new_v4()),
        };
        assert!(matches!(
            engine.send_message(&caller, missing).await,
            Err(CoreError::AttachmentNotFound)
        ));

        let attachment = Uuid::new_v4();
        store.put_attachment(AttachmentMeta {
            id: attachment,
            tenant_id: tenant,
            file_name: "report.pdf".into(),
            content_type: "application/pdf".into(),
            size_bytes: 1024,
        }).await;
        let ok = SendMessage {
            conversation_id: conv,
            client_msg_id: "c-2".into(),
            kind: MessageKind::File,
            body: "report.pdf".into(),
            attachment_id: Some(attachment),
        };
        assert!(engine.send_message(&caller, ok).await.unwrap().inserted);
    }

    #[tokio::test]
    async fn test_mark_read_validates_conversation() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let visitor = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, visitor).await;
        let other = visitor_conversation(&store, tenant, visitor).await;
        let caller = claims(tenant, visitor, Role::Visitor);

        let sent = engine
            .send_message(&caller, text(conv, "c-1", "hello"))
            .await
            .unwrap();

        let cursor = engine
            .mark_read(&caller, conv, sent.message.id)
            .await
            .unwrap();
        assert_eq!(cursor.last_read_msg_id, sent.message.id);

        // The same message id against another conversation must not pass
        assert!(matches!(
            engine.mark_read(&caller, other, sent.message.id).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.mark_read(&caller, conv, Uuid::new_v4()).await,
            Err(CoreError::MessageNotFound)
        ));
    }

    #[tokio::test]
    async fn test_pagination_resets_on_dangling_cursor() {
        let (store, engine) = harness();
        let tenant = Uuid::new_v4();
        let visitor = Uuid::new_v4();
        let conv = visitor_conversation(&store, tenant, visitor).await;
        let caller = claims(tenant, visitor, Role::Visitor);

        for n in 0..3 {
            engine
                .send_message(&caller, text(conv, &format!("c-{n}"), &format!("m{n}")))
                .await
                .unwrap();
        }

        let first = engine
            .list_messages(&caller, conv, None, 2)
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 2);
        assert!(!first.reset);

        let rest = engine
            .list_messages(&caller, conv, Some(first.messages[1].id), 10)
            .await
            .unwrap();
        assert_eq!(rest.messages.len(), 1);
        assert_eq!(rest.messages[0].body, "m2");

        // Cursor pointing at a message that never existed restarts cleanly
        let reset = engine
            .list_messages(&caller, conv, Some(Uuid::new_v4()), 10)
            .await
            .unwrap();
        assert!(reset.reset);
        assert_eq!(reset.messages.len(), 3);
    }
}
