use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::error::ApiError;
use crate::middleware::auth_context::AuthContext;
use crate::models::*;
use crate::routes::billing_routes::BILL_UNPAID;

pub fn router() -> Router<AppState> {
    Router::new().route("/home", get(home))
}

#[derive(Debug, Serialize)]
pub struct HomeData {
    pub view: String,
    pub appointments_today: i64,
    pub pending_cases: i64,
    pub unpaid_bills: i64,
    pub unread_messages: i64,
}

/// Dashboard counters, scoped to what the caller can see: PTs get their own
/// schedule, clinic/admin get the whole clinic.
pub async fn home(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<HomeData>>, ApiError> {
    let view = role_to_string(auth.role);

    let appointments_today: i64 = if auth.role == ROLE_PT {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM appointment
            WHERE pt_user_id = $1
              AND start_at >= date_trunc('day', now())
              AND start_at < date_trunc('day', now()) + interval '1 day'
              AND status IN ($2, $3)
            "#,
        )
        .bind(auth.user_id)
        .bind(STATUS_PENDING)
        .bind(STATUS_ACCEPTED)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?
    } else {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM appointment
            WHERE clinic_id = $1
              AND start_at >= date_trunc('day', now())
              AND start_at < date_trunc('day', now()) + interval '1 day'
              AND status IN ($2, $3)
            "#,
        )
        .bind(auth.clinic_id)
        .bind(STATUS_PENDING)
        .bind(STATUS_ACCEPTED)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?
    };

    let pending_cases: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM pn_case
        WHERE clinic_id = $1
          AND status = $2
        "#,
    )
    .bind(auth.clinic_id)
    .bind(STATUS_PENDING)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    let unpaid_bills: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM bill
        WHERE clinic_id = $1
          AND status = $2
        "#,
    )
    .bind(auth.clinic_id)
    .bind(BILL_UNPAID)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    let unread_messages: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM chat_message m
        JOIN chat_conversation c ON c.conversation_id = m.conversation_id
        WHERE (c.user_a = $1 OR c.user_b = $1)
          AND m.sender_id <> $1
          AND m.read_at IS NULL
        "#,
    )
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: HomeData {
            view,
            appointments_today,
            pending_cases,
            unpaid_bills,
            unread_messages,
        },
    }))
}
