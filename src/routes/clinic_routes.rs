use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clinics", get(list_clinics).post(create_clinic))
        .route("/clinics/{clinic_id}", get(get_clinic).patch(update_clinic))
        // Tenant branding loads before login, so no auth here.
        .route("/clinics/{clinic_id}/theme", get(get_theme))
        .route("/clinics/{clinic_id}/notify_settings", patch(update_notify_settings))
        .route("/clinics/{clinic_id}/deactivate", post(deactivate_clinic))
}

fn ensure_admin(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN {
        Ok(())
    } else {
        Err(ApiError::Forbidden("FORBIDDEN", "admin only".into()))
    }
}

fn ensure_can_edit_clinic(auth: &AuthContext, clinic_id: Uuid) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || (auth.role == ROLE_CLINIC && auth.clinic_id == clinic_id) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin or this clinic's manager can edit it".into(),
        ))
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ClinicDetailRow {
    pub clinic_id: Uuid,
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub line_channel_token: Option<String>,
    pub google_calendar_id: Option<String>,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn list_clinics(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ClinicDetailRow>>>, ApiError> {
    ensure_admin(&auth)?;

    let rows: Vec<ClinicDetailRow> = sqlx::query_as::<_, ClinicDetailRow>(
        r#"
        SELECT clinic_id, code, name, address, phone, brand_color, logo_url,
               line_channel_token, google_calendar_id, is_active, created_at
        FROM clinic
        ORDER BY code ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ApiOk<ClinicDetailRow>>, ApiError> {
    if auth.role != ROLE_ADMIN && auth.clinic_id != clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Cannot view other clinics".into(),
        ));
    }

    let row: ClinicDetailRow = sqlx::query_as::<_, ClinicDetailRow>(
        r#"
        SELECT clinic_id, code, name, address, phone, brand_color, logo_url,
               line_channel_token, google_calendar_id, is_active, created_at
        FROM clinic
        WHERE clinic_id = $1
        "#,
    )
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct CreateClinicRequest {
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

fn validate_clinic_code(code: &str) -> Result<(), ApiError> {
    // CL001-style codes: CL + three digits.
    let ok = code.len() == 5
        && code.starts_with("CL")
        && code[2..].chars().all(|c| c.is_ascii_digit());
    if !ok {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "code must look like CL001".into(),
        ));
    }
    Ok(())
}

pub async fn create_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateClinicRequest>,
) -> Result<Json<ApiOk<ClinicDetailRow>>, ApiError> {
    ensure_admin(&auth)?;

    let code = req.code.trim().to_uppercase();
    validate_clinic_code(&code)?;
    let name = req.name.trim();
    if name.is_empty() || name.len() > 128 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "name is required (max 128)".into(),
        ));
    }

    let row: ClinicDetailRow = sqlx::query_as::<_, ClinicDetailRow>(
        r#"
        INSERT INTO clinic (code, name, address, phone)
        VALUES ($1, $2, $3, $4)
        RETURNING clinic_id, code, name, address, phone, brand_color, logo_url,
                  line_channel_token, google_calendar_id, is_active, created_at
        "#,
    )
    .bind(&code)
    .bind(name)
    .bind(req.address.as_deref())
    .bind(req.phone.as_deref())
    .fetch_one(&state.db)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            ApiError::Conflict("CODE_TAKEN", "A clinic with this code already exists".into())
        }
        other => ApiError::db(other),
    })?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClinicRequest {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
}

pub async fn update_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
    Json(req): Json<UpdateClinicRequest>,
) -> Result<Json<ApiOk<ClinicDetailRow>>, ApiError> {
    ensure_can_edit_clinic(&auth, clinic_id)?;

    if let Some(name) = req.name.as_deref() {
        if name.trim().is_empty() || name.len() > 128 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "name must be non-empty (max 128)".into(),
            ));
        }
    }
    if let Some(color) = req.brand_color.as_deref() {
        let ok = color.len() == 7
            && color.starts_with('#')
            && color[1..].chars().all(|c| c.is_ascii_hexdigit());
        if !ok {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "brand_color must be a #rrggbb value".into(),
            ));
        }
    }

    let row: ClinicDetailRow = sqlx::query_as::<_, ClinicDetailRow>(
        r#"
        UPDATE clinic
        SET name = COALESCE($2, name),
            address = COALESCE($3, address),
            phone = COALESCE($4, phone),
            brand_color = COALESCE($5, brand_color),
            logo_url = COALESCE($6, logo_url)
        WHERE clinic_id = $1
        RETURNING clinic_id, code, name, address, phone, brand_color, logo_url,
                  line_channel_token, google_calendar_id, is_active, created_at
        "#,
    )
    .bind(clinic_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.address.as_deref())
    .bind(req.phone.as_deref())
    .bind(req.brand_color.as_deref())
    .bind(req.logo_url.as_deref())
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Per-tenant notification settings
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UpdateNotifySettingsRequest {
    pub smtp_host: Option<String>,
    pub smtp_port: Option<i32>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from_email: Option<String>,
    pub smtp_from_name: Option<String>,
    pub line_channel_token: Option<String>,
    pub google_calendar_id: Option<String>,
}

pub async fn update_notify_settings(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
    Json(req): Json<UpdateNotifySettingsRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    ensure_can_edit_clinic(&auth, clinic_id)?;

    if let Some(port) = req.smtp_port {
        if !(1..=65535).contains(&port) {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "smtp_port out of range".into(),
            ));
        }
    }

    let res = sqlx::query(
        r#"
        UPDATE clinic
        SET smtp_host = COALESCE($2, smtp_host),
            smtp_port = COALESCE($3, smtp_port),
            smtp_username = COALESCE($4, smtp_username),
            smtp_password = COALESCE($5, smtp_password),
            smtp_from_email = COALESCE($6, smtp_from_email),
            smtp_from_name = COALESCE($7, smtp_from_name),
            line_channel_token = COALESCE($8, line_channel_token),
            google_calendar_id = COALESCE($9, google_calendar_id)
        WHERE clinic_id = $1
        "#,
    )
    .bind(clinic_id)
    .bind(req.smtp_host.as_deref())
    .bind(req.smtp_port)
    .bind(req.smtp_username.as_deref())
    .bind(req.smtp_password.as_deref())
    .bind(req.smtp_from_email.as_deref())
    .bind(req.smtp_from_name.as_deref())
    .bind(req.line_channel_token.as_deref())
    .bind(req.google_calendar_id.as_deref())
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("clinic"));
    }

    Ok(Json(OkResponse::yes()))
}

/* ============================================================
   Public theme (tenant branding)
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ThemeRow {
    pub code: String,
    pub name: String,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
}

pub async fn get_theme(
    State(state): State<AppState>,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<ApiOk<ThemeRow>>, ApiError> {
    let row: ThemeRow = sqlx::query_as::<_, ThemeRow>(
        r#"
        SELECT code, name, brand_color, logo_url
        FROM clinic
        WHERE clinic_id = $1
          AND is_active = true
        "#,
    )
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    Ok(Json(ApiOk { data: row }))
}

pub async fn deactivate_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(clinic_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    ensure_admin(&auth)?;

    let res = sqlx::query(
        r#"
        UPDATE clinic
        SET is_active = false
        WHERE clinic_id = $1
        "#,
    )
    .bind(clinic_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("clinic"));
    }

    Ok(Json(OkResponse::yes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clinic_code_shape() {
        assert!(validate_clinic_code("CL001").is_ok());
        assert!(validate_clinic_code("CL999").is_ok());
        assert!(validate_clinic_code("cl001").is_err());
        assert!(validate_clinic_code("CL01").is_err());
        assert!(validate_clinic_code("XX001").is_err());
    }
}
