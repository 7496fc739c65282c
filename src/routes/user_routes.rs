use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::hash_password,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

fn ensure_admin_or_clinic(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/clinic can manage users".into(),
        ))
    }
}

/// Clinic managers operate inside their own clinic; admins pick any.
fn effective_clinic(auth: &AuthContext, requested: Option<Uuid>) -> Result<Uuid, ApiError> {
    match (auth.role, requested) {
        (ROLE_ADMIN, Some(c)) => Ok(c),
        (ROLE_ADMIN, None) => Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "clinic_id is required for admin".into(),
        )),
        (_, Some(c)) if c != auth.clinic_id => Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Cannot manage users outside your clinic".into(),
        )),
        _ => Ok(auth.clinic_id),
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserPublicRow {
    pub user_id: Uuid,
    pub clinic_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: i16,
    pub is_active: bool,
    pub totp_enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
    pub role: i16,
    pub clinic_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub role: Option<i16>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub clinic_id: Option<Uuid>,
    pub role: Option<i16>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/{user_id}", get(get_user).patch(update_user))
        .route("/{user_id}/disable", post(disable_user))
        .route("/{user_id}/enable", post(enable_user))
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListUsersQuery>,
) -> Result<Json<ApiOk<Vec<UserPublicRow>>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let clinic_id = if auth.role == ROLE_ADMIN {
        q.clinic_id
    } else {
        Some(auth.clinic_id)
    };

    let users: Vec<UserPublicRow> = match clinic_id {
        Some(c) => sqlx::query_as::<_, UserPublicRow>(
            r#"
            SELECT user_id, clinic_id, email, display_name, role, is_active, totp_enabled, created_at
            FROM app_user
            WHERE clinic_id = $1
              AND ($2::smallint IS NULL OR role = $2)
            ORDER BY created_at DESC
            LIMIT 200
            "#,
        )
        .bind(c)
        .bind(q.role)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?,
        None => sqlx::query_as::<_, UserPublicRow>(
            r#"
            SELECT user_id, clinic_id, email, display_name, role, is_active, totp_enabled, created_at
            FROM app_user
            WHERE ($1::smallint IS NULL OR role = $1)
            ORDER BY created_at DESC
            LIMIT 200
            "#,
        )
        .bind(q.role)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?,
    };

    Ok(Json(ApiOk { data: users }))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let user: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, clinic_id, email, display_name, role, is_active, totp_enabled, created_at
        FROM app_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    if auth.role == ROLE_CLINIC && user.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Cannot view users outside your clinic".into(),
        ));
    }

    Ok(Json(ApiOk { data: user }))
}

fn validate_role(role: i16) -> Result<(), ApiError> {
    if !is_known_role(role) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "role must be one of 0..3".into(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let e = email.trim();
    if e.is_empty() || !e.contains('@') || e.len() > 254 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "a valid email is required".into(),
        ));
    }
    Ok(())
}

fn validate_display_name(display_name: &str) -> Result<(), ApiError> {
    if display_name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "display_name is required".into(),
        ));
    }
    Ok(())
}

fn validate_password(pw: &str) -> Result<(), ApiError> {
    if pw.trim().len() < 8 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "password must be at least 8 characters".into(),
        ));
    }
    Ok(())
}

pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    validate_email(&req.email)?;
    validate_display_name(&req.display_name)?;
    validate_password(&req.password)?;
    validate_role(req.role)?;

    // Only admins mint other admins.
    if req.role == ROLE_ADMIN && auth.role != ROLE_ADMIN {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin can create admin accounts".into(),
        ));
    }

    let clinic_id = effective_clinic(&auth, req.clinic_id)?;
    let email = req.email.trim().to_lowercase();
    let display_name = req.display_name.trim().to_string();
    let is_active = req.is_active.unwrap_or(true);

    let pw_hash = hash_password(req.password.trim()).map_err(ApiError::Internal)?;

    let user: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        INSERT INTO app_user (clinic_id, email, display_name, password_hash, role, is_active)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING user_id, clinic_id, email, display_name, role, is_active, totp_enabled, created_at
        "#,
    )
    .bind(clinic_id)
    .bind(&email)
    .bind(&display_name)
    .bind(&pw_hash)
    .bind(req.role)
    .bind(is_active)
    .fetch_one(&state.db)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            ApiError::Conflict("EMAIL_TAKEN", "An account with this email already exists".into())
        }
        other => ApiError::db(other),
    })?;

    Ok(Json(ApiOk { data: user }))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let existing: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, clinic_id, email, display_name, role, is_active, totp_enabled, created_at
        FROM app_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    if auth.role == ROLE_CLINIC && existing.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Cannot manage users outside your clinic".into(),
        ));
    }

    let display_name = match req.display_name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.display_name.clone(),
    };

    let role = match req.role {
        Some(r) => {
            validate_role(r)?;
            if r == ROLE_ADMIN && auth.role != ROLE_ADMIN {
                return Err(ApiError::Forbidden(
                    "FORBIDDEN",
                    "Only admin can grant the admin role".into(),
                ));
            }
            r
        }
        None => existing.role,
    };

    let is_active = req.is_active.unwrap_or(existing.is_active);

    let updated: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        UPDATE app_user
        SET display_name = $1,
            role = $2,
            is_active = $3
        WHERE user_id = $4
        RETURNING user_id, clinic_id, email, display_name, role, is_active, totp_enabled, created_at
        "#,
    )
    .bind(&display_name)
    .bind(role)
    .bind(is_active)
    .bind(user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: updated }))
}

async fn set_active(
    state: &AppState,
    auth: &AuthContext,
    user_id: Uuid,
    active: bool,
) -> Result<(), ApiError> {
    ensure_admin_or_clinic(auth)?;

    let clinic_guard = if auth.role == ROLE_CLINIC {
        Some(auth.clinic_id)
    } else {
        None
    };

    let res = sqlx::query(
        r#"
        UPDATE app_user
        SET is_active = $1
        WHERE user_id = $2
          AND ($3::uuid IS NULL OR clinic_id = $3)
        "#,
    )
    .bind(active)
    .bind(user_id)
    .bind(clinic_guard)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("user"));
    }
    Ok(())
}

pub async fn disable_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    set_active(&state, &auth, user_id, false).await?;
    Ok(Json(OkResponse::yes()))
}

pub async fn enable_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    set_active(&state, &auth, user_id, true).await?;
    Ok(Json(OkResponse::yes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_bounds() {
        assert!(validate_role(ROLE_USER).is_ok());
        assert!(validate_role(ROLE_PT).is_ok());
        assert!(validate_role(-1).is_err());
        assert!(validate_role(4).is_err());
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("pt@clinic.test").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("no-at-sign").is_err());
    }

    #[test]
    fn password_minimum() {
        assert!(validate_password("longenough").is_ok());
        assert!(validate_password("short").is_err());
    }
}
