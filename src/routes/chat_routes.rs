use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::hash_access_token,
    chat::{ChatEvent, ChatMessagePayload},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/conversations", get(list_conversations).post(open_conversation))
        .route("/chat/conversations/{conversation_id}/messages", get(list_messages).post(post_message))
        .route("/chat/conversations/{conversation_id}/read", post(mark_read))
        .route("/chat/presence/{user_id}", get(get_presence))
        .route("/chat/ws", get(ws_handler))
}

/// Conversations are keyed by the ordered user pair, so the same two people
/// always land in the same row.
fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConversationRow {
    pub conversation_id: Uuid,
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

async fn load_conversation_for(
    state: &AppState,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<ConversationRow, ApiError> {
    let row: ConversationRow = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT conversation_id, user_a, user_b, created_at, last_message_at
        FROM chat_conversation
        WHERE conversation_id = $1
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("conversation"))?;

    if row.user_a != user_id && row.user_b != user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Not a party to this conversation".into(),
        ));
    }
    Ok(row)
}

fn other_party(row: &ConversationRow, me: Uuid) -> Uuid {
    if row.user_a == me { row.user_b } else { row.user_a }
}

/* ============================================================
   REST: conversations
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ConversationListItem {
    pub conversation_id: Uuid,
    pub peer_user_id: Uuid,
    pub peer_display_name: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ConversationListItem>>>, ApiError> {
    let rows: Vec<ConversationListItem> = sqlx::query_as::<_, ConversationListItem>(
        r#"
        SELECT c.conversation_id,
               u.user_id AS peer_user_id,
               u.display_name AS peer_display_name,
               c.last_message_at,
               (SELECT COUNT(*)
                  FROM chat_message m
                 WHERE m.conversation_id = c.conversation_id
                   AND m.sender_id <> $1
                   AND m.read_at IS NULL) AS unread_count
        FROM chat_conversation c
        JOIN app_user u
          ON u.user_id = CASE WHEN c.user_a = $1 THEN c.user_b ELSE c.user_a END
        WHERE c.user_a = $1 OR c.user_b = $1
        ORDER BY c.last_message_at DESC NULLS LAST
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct OpenConversationRequest {
    pub user_id: Uuid,
}

pub async fn open_conversation(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<OpenConversationRequest>,
) -> Result<Json<ApiOk<ConversationRow>>, ApiError> {
    if req.user_id == auth.user_id {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "cannot open a conversation with yourself".into(),
        ));
    }

    let peer: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT user_id
        FROM app_user
        WHERE user_id = $1
          AND is_active = true
        "#,
    )
    .bind(req.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    if peer.is_none() {
        return Err(ApiError::not_found("user"));
    }

    let (user_a, user_b) = ordered_pair(auth.user_id, req.user_id);

    // Get-or-create against the unique pair constraint.
    let row: ConversationRow = sqlx::query_as::<_, ConversationRow>(
        r#"
        INSERT INTO chat_conversation (user_a, user_b)
        VALUES ($1, $2)
        ON CONFLICT (user_a, user_b) DO UPDATE SET user_a = EXCLUDED.user_a
        RETURNING conversation_id, user_a, user_b, created_at, last_message_at
        "#,
    )
    .bind(user_a)
    .bind(user_b)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   REST: messages
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MessageRow {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<ApiOk<Vec<MessageRow>>>, ApiError> {
    load_conversation_for(&state, auth.user_id, conversation_id).await?;

    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let rows: Vec<MessageRow> = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT message_id, conversation_id, sender_id, body, sent_at, read_at
        FROM chat_message
        WHERE conversation_id = $1
          AND ($2::timestamptz IS NULL OR sent_at < $2)
        ORDER BY sent_at DESC
        LIMIT $3
        "#,
    )
    .bind(conversation_id)
    .bind(q.before)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub body: String,
}

fn validate_body(body: &str) -> Result<&str, ApiError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "message body is required".into(),
        ));
    }
    if body.len() > 4000 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "message body is too long (max 4000)".into(),
        ));
    }
    Ok(body)
}

/// Persist a message and relay it to both parties' live sockets. Shared by
/// the REST endpoint and the WebSocket loop.
async fn store_and_relay(
    state: &AppState,
    conversation: &ConversationRow,
    sender_id: Uuid,
    body: &str,
) -> Result<MessageRow, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let row: MessageRow = sqlx::query_as::<_, MessageRow>(
        r#"
        INSERT INTO chat_message (conversation_id, sender_id, body)
        VALUES ($1, $2, $3)
        RETURNING message_id, conversation_id, sender_id, body, sent_at, read_at
        "#,
    )
    .bind(conversation.conversation_id)
    .bind(sender_id)
    .bind(body)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE chat_conversation
        SET last_message_at = $2
        WHERE conversation_id = $1
        "#,
    )
    .bind(conversation.conversation_id)
    .bind(row.sent_at)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    let event = ChatEvent::Message {
        message: ChatMessagePayload {
            message_id: row.message_id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            body: row.body.clone(),
            sent_at: row.sent_at,
        },
    };
    state.chat.send_to(other_party(conversation, sender_id), &event).await;
    state.chat.send_to(sender_id, &event).await;

    Ok(row)
}

pub async fn post_message(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<ApiOk<MessageRow>>, ApiError> {
    let conversation = load_conversation_for(&state, auth.user_id, conversation_id).await?;
    let body = validate_body(&req.body)?;
    let row = store_and_relay(&state, &conversation, auth.user_id, body).await?;
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Serialize)]
pub struct MarkReadData {
    pub marked: i64,
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ApiOk<MarkReadData>>, ApiError> {
    let conversation = load_conversation_for(&state, auth.user_id, conversation_id).await?;

    let res = sqlx::query(
        r#"
        UPDATE chat_message
        SET read_at = now()
        WHERE conversation_id = $1
          AND sender_id <> $2
          AND read_at IS NULL
        "#,
    )
    .bind(conversation_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    state
        .chat
        .send_to(
            other_party(&conversation, auth.user_id),
            &ChatEvent::Read {
                conversation_id,
                by_user_id: auth.user_id,
            },
        )
        .await;

    Ok(Json(ApiOk {
        data: MarkReadData {
            marked: res.rows_affected() as i64,
        },
    }))
}

#[derive(Debug, Serialize)]
pub struct PresenceData {
    pub user_id: Uuid,
    pub online: bool,
}

pub async fn get_presence(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<PresenceData>>, ApiError> {
    Ok(Json(ApiOk {
        data: PresenceData {
            user_id,
            online: state.chat.is_online(user_id).await,
        },
    }))
}

/* ============================================================
   WebSocket
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    /// Browsers cannot set Authorization on the upgrade request.
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEvent {
    Message { conversation_id: Uuid, body: String },
    Typing { conversation_id: Uuid },
    Read { conversation_id: Uuid },
}

async fn authenticate_ws(state: &AppState, token: &str) -> Result<Uuid, ApiError> {
    let token_hash = hash_access_token(token);
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT st.user_id
        FROM session_token st
        JOIN app_user u ON u.user_id = st.user_id
        WHERE st.session_token_hash = $1
          AND st.revoked_at IS NULL
          AND st.expires_at > now()
          AND u.is_active = true
        "#,
    )
    .bind(&token_hash)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = authenticate_ws(&state, &q.token).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, user_id, socket)))
}

async fn handle_socket(state: AppState, user_id: Uuid, socket: WebSocket) {
    let mut rx = state.chat.subscribe(user_id).await;
    let (mut sink, mut stream) = socket.split();

    // Registry -> socket
    let forward = tokio::spawn(async move {
        while let Ok(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Socket -> handlers
    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                debug!("ignoring malformed chat event from {user_id}: {e}");
                continue;
            }
        };
        if let Err(e) = handle_client_event(&state, user_id, event).await {
            debug!("chat event from {user_id} rejected: {e:?}");
        }
    }

    forward.abort();
    state.chat.reap(user_id).await;
}

async fn handle_client_event(
    state: &AppState,
    user_id: Uuid,
    event: ClientEvent,
) -> Result<(), ApiError> {
    match event {
        ClientEvent::Message { conversation_id, body } => {
            let conversation = load_conversation_for(state, user_id, conversation_id).await?;
            let body = validate_body(&body)?;
            store_and_relay(state, &conversation, user_id, body).await?;
        }
        ClientEvent::Typing { conversation_id } => {
            let conversation = load_conversation_for(state, user_id, conversation_id).await?;
            state
                .chat
                .send_to(
                    other_party(&conversation, user_id),
                    &ChatEvent::Typing {
                        conversation_id,
                        from_user_id: user_id,
                    },
                )
                .await;
        }
        ClientEvent::Read { conversation_id } => {
            let conversation = load_conversation_for(state, user_id, conversation_id).await?;
            sqlx::query(
                r#"
                UPDATE chat_message
                SET read_at = now()
                WHERE conversation_id = $1
                  AND sender_id <> $2
                  AND read_at IS NULL
                "#,
            )
            .bind(conversation_id)
            .bind(user_id)
            .execute(&state.db)
            .await
            .map_err(ApiError::db)?;
            state
                .chat
                .send_to(
                    other_party(&conversation, user_id),
                    &ChatEvent::Read {
                        conversation_id,
                        by_user_id: user_id,
                    },
                )
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_ordering_is_stable() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(ordered_pair(a, b), ordered_pair(b, a));
        let (lo, hi) = ordered_pair(a, b);
        assert!(lo <= hi);
    }

    #[test]
    fn body_validation() {
        assert!(validate_body("hello").is_ok());
        assert!(validate_body("   ").is_err());
        assert!(validate_body(&"x".repeat(4001)).is_err());
        assert_eq!(validate_body("  trimmed  ").unwrap(), "trimmed");
    }

    #[test]
    fn client_events_deserialize() {
        let e: ClientEvent = serde_json::from_str(
            &format!(r#"{{"type":"typing","conversation_id":"{}"}}"#, Uuid::new_v4()),
        )
        .unwrap();
        assert!(matches!(e, ClientEvent::Typing { .. }));
    }
}
