//! WebSocket handler for Axum
//!
//! Connections authenticate either by `?token=` query parameter (checked
//! before the upgrade) or by an `auth` frame sent first after the upgrade.
//! Visitor connections are additionally gated by their site's origin
//! allow-list. `ping` frames double as presence heartbeats.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use chatwire_shared::{Claims, CoreError, MessageKind, Role};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use chatwire_engine::messaging::SendMessage;

use crate::state::AppState;

use super::connection::Connection;
use super::events::{ClientEvent, ServerEvent};

/// How long an un-authenticated socket may sit before the first auth frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How many queued conversations one agent may pick up right after
/// connecting.
const CONNECT_BACKFILL_MAX: i64 = 5;

/// Replay depth for lifecycle events in a SYNC response.
const SYNC_EVENT_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    // Query-token connections are rejected before the upgrade; auth-frame
    // connections are admitted and must authenticate as their first frame.
    let pre_auth = match params.token.as_deref() {
        Some(token) => {
            let claims = state
                .verifier
                .verify(token)
                .map_err(|_| StatusCode::UNAUTHORIZED)?;
            if origin_allowed(&state, &claims, origin.as_deref())
                .await
                .is_err()
            {
                return Err(StatusCode::FORBIDDEN);
            }
            Some(claims)
        }
        None => None,
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, pre_auth, origin)))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    pre_auth: Option<Claims>,
    origin: Option<String>,
) {
    // Authenticate before any state is attached: either carried over from
    // the query token, or the first frame within the timeout window. A
    // rejected socket is closed with the policy-violation code.
    let claims = match pre_auth {
        Some(claims) => claims,
        None => match await_auth_frame(&state, &mut socket, origin.as_deref()).await {
            Some(claims) => claims,
            None => return,
        },
    };

    let (mut ws_sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize WebSocket frame");
                }
            }
        }
    });

    let mut presence_id = match state
        .engine
        .presence()
        .create_session(claims.tenant_id, claims.user_id)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create presence session");
            let _ = tx.send(error_frame(&e));
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    let conn = Connection::new(claims.user_id, claims.tenant_id, claims.role, tx.clone());
    let conn = state.hub.add_connection(conn).await;
    conn.send(ServerEvent::AuthOk {
        session_id: conn.conn_id,
        user_id: claims.user_id,
    });

    if claims.role.is_staff() {
        broadcast_staff_status(&state, &claims).await;
        match state
            .engine
            .try_assign_from_queue_to_agent(claims.tenant_id, claims.user_id, CONNECT_BACKFILL_MAX)
            .await
        {
            Ok(placed) if !placed.is_empty() => {
                tracing::info!(
                    user_id = %claims.user_id,
                    count = placed.len(),
                    "Backfilled queued conversations to connecting agent"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Connect-time queue backfill failed");
            }
        }
    }

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::Ping) => {
                    handle_ping(&state, &claims, &mut presence_id, &conn).await;
                }
                Ok(ClientEvent::Auth { .. }) => {
                    conn.send(ServerEvent::Error {
                        code: "already_authenticated".to_string(),
                        message: "Connection is already authenticated".to_string(),
                    });
                }
                Ok(event) => {
                    handle_client_event(event, &state, &claims, Arc::clone(&conn)).await;
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to parse client frame");
                    conn.send(ServerEvent::Error {
                        code: "bad_frame".to_string(),
                        message: "Invalid frame format".to_string(),
                    });
                }
            },
            WsMessage::Close(_) => break,
            // Protocol-level ping/pong is handled by axum itself
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            _ => {}
        }
    }

    // Teardown: the hub entry, the presence session, and (for staff) a
    // status re-broadcast now that this device is gone
    tracing::info!(conn_id = %conn.conn_id, user_id = %claims.user_id, "WebSocket closing");
    state.hub.remove_connection(&conn.conn_id).await;
    if let Err(e) = state
        .engine
        .presence()
        .logout(presence_id, claims.user_id)
        .await
    {
        tracing::warn!(error = %e, "Presence logout failed");
    }
    if claims.role.is_staff() {
        broadcast_staff_status(&state, &claims).await;
    }

    drop(tx);
    let _ = send_task.await;
}

/// Wait for the opening `auth` frame on connections without a query token.
/// Any rejection sends the error frame and then closes with the
/// policy-violation code.
async fn await_auth_frame(
    state: &AppState,
    socket: &mut WebSocket,
    origin: Option<&str>,
) -> Option<Claims> {
    let frame = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await;
    let Ok(Some(Ok(WsMessage::Text(text)))) = frame else {
        let _ = socket.send(policy_close()).await;
        return None;
    };
    let Ok(ClientEvent::Auth { token }) = serde_json::from_str::<ClientEvent>(&text) else {
        reject_auth(
            socket,
            &ServerEvent::Error {
                code: "unauthorized".to_string(),
                message: "First frame must be auth".to_string(),
            },
        )
        .await;
        return None;
    };
    let claims = match state.verifier.verify(&token) {
        Ok(claims) => claims,
        Err(_) => {
            reject_auth(
                socket,
                &ServerEvent::Error {
                    code: "unauthorized".to_string(),
                    message: "Invalid or expired token".to_string(),
                },
            )
            .await;
            return None;
        }
    };
    if let Err(e) = origin_allowed(state, &claims, origin).await {
        reject_auth(socket, &error_frame(&e)).await;
        return None;
    }
    Some(claims)
}

/// Deliver the rejection reason, then the policy-violation close frame.
async fn reject_auth(socket: &mut WebSocket, event: &ServerEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(WsMessage::Text(json)).await;
    }
    let _ = socket.send(policy_close()).await;
}

fn policy_close() -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: "authentication failed".into(),
    }))
}

/// Heartbeat plus staff status re-broadcast. An expired presence session is
/// replaced transparently.
async fn handle_ping(
    state: &AppState,
    claims: &Claims,
    presence_id: &mut Uuid,
    conn: &Arc<Connection>,
) {
    let presence = state.engine.presence();
    match presence.heartbeat(*presence_id, claims.user_id).await {
        Ok(true) => {}
        Ok(false) => match presence
            .create_session(claims.tenant_id, claims.user_id)
            .await
        {
            Ok(new_id) => *presence_id = new_id,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to replace expired presence session");
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Presence heartbeat failed");
        }
    }
    conn.send(ServerEvent::Pong);

    if claims.role.is_staff() {
        broadcast_staff_status(state, claims).await;
    }
}

async fn handle_client_event(
    event: ClientEvent,
    state: &AppState,
    claims: &Claims,
    conn: Arc<Connection>,
) {
    match event {
        ClientEvent::Sub { conversation_id } => {
            match state
                .engine
                .authorized_conversation(claims, conversation_id)
                .await
            {
                Ok(_) => {
                    conn.subscribe(conversation_id).await;
                    state.hub.join(conversation_id, Arc::clone(&conn)).await;
                    conn.send(ServerEvent::SubOk { conversation_id });
                }
                Err(e) => conn.send(error_frame(&e)),
            }
        }

        ClientEvent::Unsub { conversation_id } => {
            conn.unsubscribe(conversation_id).await;
            state.hub.leave(&conversation_id, &conn.conn_id).await;
            conn.send(ServerEvent::UnsubOk { conversation_id });
        }

        ClientEvent::MsgSend {
            conversation_id,
            client_msg_id,
            kind,
            body,
            attachment_id,
        } => {
            let send = SendMessage {
                conversation_id,
                client_msg_id: client_msg_id.clone(),
                kind: kind.unwrap_or(MessageKind::Text),
                body,
                attachment_id,
            };
            match state.engine.send_message(claims, send).await {
                Ok(outcome) => {
                    conn.send(ServerEvent::MsgAck {
                        client_msg_id,
                        message: outcome.message.clone(),
                        duplicate: !outcome.inserted,
                    });
                    if outcome.inserted {
                        state
                            .hub
                            .broadcast_conversation(
                                &conversation_id,
                                ServerEvent::Msg {
                                    message: outcome.message,
                                },
                                Some(conn.conn_id),
                            )
                            .await;
                    }
                }
                Err(e) => conn.send(error_frame(&e)),
            }
        }

        ClientEvent::MsgRead {
            conversation_id,
            message_id,
        } => match state.engine.mark_read(claims, conversation_id, message_id).await {
            Ok(cursor) => {
                conn.send(ServerEvent::MsgReadOk { cursor });
                state
                    .hub
                    .broadcast_conversation(
                        &conversation_id,
                        ServerEvent::Read {
                            conversation_id,
                            user_id: claims.user_id,
                            message_id,
                        },
                        Some(conn.conn_id),
                    )
                    .await;
            }
            Err(e) => conn.send(error_frame(&e)),
        },

        ClientEvent::Typing { conversation_id, on } => {
            // Relayed only within rooms this connection actually joined
            if conn.subscriptions.read().await.contains(&conversation_id) {
                state
                    .hub
                    .broadcast_conversation(
                        &conversation_id,
                        ServerEvent::Typing {
                            conversation_id,
                            user_id: claims.user_id,
                            on,
                        },
                        Some(conn.conn_id),
                    )
                    .await;
            }
        }

        ClientEvent::Sync {
            conversation_id,
            after_msg_id,
            limit,
        } => {
            let page = match state
                .engine
                .list_messages(claims, conversation_id, after_msg_id, limit.unwrap_or(50))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    conn.send(error_frame(&e));
                    return;
                }
            };
            // Lifecycle events ride only the first page (or a reset, which
            // restarts from the top); later pages carry an empty list.
            let events = if after_msg_id.is_none() || page.reset {
                match state
                    .engine
                    .conversation_events(claims, conversation_id, SYNC_EVENT_LIMIT)
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        conn.send(error_frame(&e));
                        return;
                    }
                }
            } else {
                Vec::new()
            };
            conn.send(ServerEvent::SyncRes {
                conversation_id,
                messages: page.messages,
                events,
                reset: page.reset,
            });
        }

        // Handled in the socket loop
        ClientEvent::Auth { .. } | ClientEvent::Ping => {}
    }
}

/// Re-broadcast one staff member's effective status to the tenant's staff.
async fn broadcast_staff_status(state: &AppState, claims: &Claims) {
    match state
        .engine
        .effective_status(claims.tenant_id, claims.user_id)
        .await
    {
        Ok(status) => {
            state
                .hub
                .broadcast_tenant_staff(
                    claims.tenant_id,
                    ServerEvent::PresenceUpdate {
                        user_id: claims.user_id,
                        status,
                    },
                )
                .await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to derive effective status");
        }
    }
}

/// Visitor connections must come from one of the site's allowed origins.
/// An empty allow-list admits everything (local development sites).
async fn origin_allowed(
    state: &AppState,
    claims: &Claims,
    origin: Option<&str>,
) -> Result<(), CoreError> {
    if claims.role != Role::Visitor {
        return Ok(());
    }
    let Some(site_id) = claims.site_id else {
        return Ok(());
    };
    let allowed = state
        .engine
        .store()
        .site_allowed_origins(claims.tenant_id, site_id)
        .await?;
    if allowed.is_empty() {
        return Ok(());
    }
    match origin {
        Some(o) if allowed.iter().any(|a| a == o) => Ok(()),
        _ => Err(CoreError::OriginNotAllowed),
    }
}

fn error_frame(err: &CoreError) -> ServerEvent {
    ServerEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use chatwire_engine::lock::MemoryLock;
    use chatwire_engine::presence::MemoryPresence;
    use chatwire_engine::store::{ConversationStore, MemoryStore, NewConversation, NewMessage};
    use chatwire_engine::Engine;
    use chatwire_shared::{EventKind, SenderKind};
    use sqlx::postgres::PgPoolOptions;

    use super::*;
    use crate::auth::JwtVerifier;
    use crate::config::Config;
    use crate::websocket::hub::SessionHub;

    fn test_state(store: Arc<MemoryStore>) -> AppState {
        let engine = Engine::new(
            store,
            Arc::new(MemoryPresence::new(Duration::from_secs(30))),
            Arc::new(MemoryLock::new()),
        );
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: "postgres://localhost/unused".to_string(),
            database_max_connections: 1,
            redis_url: "redis://localhost".to_string(),
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            presence_ttl: Duration::from_secs(45),
            heartbeat_interval: Duration::from_secs(20),
            assign_override_admin_only: false,
        };
        AppState {
            // Never dialed; the engine runs on the in-memory store here
            pool: PgPoolOptions::new()
                .connect_lazy(&config.database_url)
                .unwrap(),
            config: Arc::new(config),
            engine,
            hub: SessionHub::new(),
            verifier: Arc::new(JwtVerifier::new("0123456789abcdef0123456789abcdef")),
        }
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        rx.try_recv().expect("expected a frame")
    }

    #[tokio::test]
    async fn test_sync_events_ride_only_the_first_page() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let conversation = store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: Some("cust".into()),
                skill_group_id: None,
                site_id: None,
                visitor_id: None,
            })
            .await
            .unwrap()
            .id;
        store
            .insert_event(tenant, conversation, EventKind::Started, serde_json::json!({}))
            .await
            .unwrap();
        for n in 0..2 {
            store
                .insert_message(NewMessage {
                    tenant_id: tenant,
                    conversation_id: conversation,
                    sender_kind: SenderKind::Customer,
                    sender_id: Uuid::new_v4(),
                    client_msg_id: format!("c-{n}"),
                    kind: MessageKind::Text,
                    body: format!("hello {n}"),
                    attachment_id: None,
                })
                .await
                .unwrap();
        }

        let state = test_state(store);
        let claims = Claims {
            user_id: agent,
            tenant_id: tenant,
            role: Role::Agent,
            site_id: None,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(agent, tenant, Role::Agent, tx));

        handle_client_event(
            ClientEvent::Sync {
                conversation_id: conversation,
                after_msg_id: None,
                limit: Some(1),
            },
            &state,
            &claims,
            Arc::clone(&conn),
        )
        .await;
        let first_page_last = match recv(&mut rx) {
            ServerEvent::SyncRes { events, messages, .. } => {
                assert_eq!(events.len(), 1);
                assert_eq!(messages.len(), 1);
                messages[0].id
            }
            other => panic!("unexpected frame: {other:?}"),
        };

        handle_client_event(
            ClientEvent::Sync {
                conversation_id: conversation,
                after_msg_id: Some(first_page_last),
                limit: Some(10),
            },
            &state,
            &claims,
            conn,
        )
        .await;
        match recv(&mut rx) {
            ServerEvent::SyncRes { events, messages, reset, .. } => {
                // Later pages carry only messages; events already went out
                // with the first page
                assert!(events.is_empty());
                assert_eq!(messages.len(), 1);
                assert!(!reset);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_reset_page_replays_events() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let conversation = store
            .insert_conversation(NewConversation {
                tenant_id: tenant,
                customer_ref: Some("cust".into()),
                skill_group_id: None,
                site_id: None,
                visitor_id: None,
            })
            .await
            .unwrap()
            .id;
        store
            .insert_event(tenant, conversation, EventKind::Started, serde_json::json!({}))
            .await
            .unwrap();

        let state = test_state(store);
        let agent = Uuid::new_v4();
        let claims = Claims {
            user_id: agent,
            tenant_id: tenant,
            role: Role::Agent,
            site_id: None,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(agent, tenant, Role::Agent, tx));

        // An unknown cursor restarts from the top, which counts as a first
        // page again
        handle_client_event(
            ClientEvent::Sync {
                conversation_id: conversation,
                after_msg_id: Some(Uuid::new_v4()),
                limit: Some(10),
            },
            &state,
            &claims,
            conn,
        )
        .await;
        match recv(&mut rx) {
            ServerEvent::SyncRes { events, reset, .. } => {
                assert!(reset);
                assert_eq!(events.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_auth_rejection_closes_with_policy_code() {
        match policy_close() {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, close_code::POLICY),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
