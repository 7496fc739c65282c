use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::models::AppState;

/// Records every mutating API call in audit_log. Reads are skipped to keep
/// the table useful. Failures here must never fail the request.
pub async fn audit_layer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let user_id = match req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => lookup_user(&state, token).await,
        None => None,
    };

    let res = next.run(req).await;

    if method != axum::http::Method::GET {
        let status = res.status().as_u16() as i16;
        let _ = sqlx::query(
            r#"
            INSERT INTO audit_log (user_id, method, path, status)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(method.as_str())
        .bind(&path)
        .bind(status)
        .execute(&state.db)
        .await;
    }

    res
}

async fn lookup_user(state: &AppState, token: &str) -> Option<Uuid> {
    let token_hash = hash_access_token(token);
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT user_id
        FROM session_token
        WHERE session_token_hash = $1
          AND revoked_at IS NULL
          AND expires_at > now()
        "#,
    )
    .bind(&token_hash)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
}
