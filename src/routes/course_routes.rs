use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    routes::billing_routes::BILL_UNPAID,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/course_templates", get(list_templates).post(create_template))
        .route("/course_templates/{template_id}", patch(update_template))
        .route("/courses/purchase", post(purchase_course))
        .route("/courses", get(list_courses))
        .route("/courses/{course_id}", get(get_course))
        .route("/courses/{course_id}/share", post(share_course))
        .route("/courses/{course_id}/unshare", post(unshare_course))
        .route("/courses/{course_id}/adjust", post(adjust_course))
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC || auth.role == ROLE_PT {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can manage courses".into(),
        ))
    }
}

fn ensure_admin_or_clinic(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/clinic can manage course templates".into(),
        ))
    }
}

/* ============================================================
   Templates
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TemplateRow {
    pub template_id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub total_sessions: i32,
    pub price_cents: i64,
    pub validity_days: Option<i32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn list_templates(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<TemplateRow>>>, ApiError> {
    ensure_staff(&auth)?;

    let rows: Vec<TemplateRow> = sqlx::query_as::<_, TemplateRow>(
        r#"
        SELECT template_id, clinic_id, name, description, total_sessions,
               price_cents, validity_days, is_active, created_at
        FROM course_template
        WHERE clinic_id = $1
          AND is_active = true
        ORDER BY name ASC
        "#,
    )
    .bind(auth.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub description: Option<String>,
    pub total_sessions: i32,
    pub price_cents: i64,
    pub validity_days: Option<i32>,
}

fn validate_template(total_sessions: i32, price_cents: i64, validity_days: Option<i32>) -> Result<(), ApiError> {
    if total_sessions <= 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "total_sessions must be positive".into(),
        ));
    }
    if price_cents < 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "price_cents cannot be negative".into(),
        ));
    }
    if let Some(v) = validity_days {
        if v <= 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "validity_days must be positive when set".into(),
            ));
        }
    }
    Ok(())
}

pub async fn create_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<Json<ApiOk<TemplateRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "name is required".into()));
    }
    validate_template(req.total_sessions, req.price_cents, req.validity_days)?;

    let row: TemplateRow = sqlx::query_as::<_, TemplateRow>(
        r#"
        INSERT INTO course_template (clinic_id, name, description, total_sessions,
                                     price_cents, validity_days)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING template_id, clinic_id, name, description, total_sessions,
                  price_cents, validity_days, is_active, created_at
        "#,
    )
    .bind(auth.clinic_id)
    .bind(name)
    .bind(req.description.as_deref())
    .bind(req.total_sessions)
    .bind(req.price_cents)
    .bind(req.validity_days)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub is_active: Option<bool>,
}

/// Session counts are immutable once a template exists; sold courses froze
/// their own copy at purchase time anyway.
pub async fn update_template(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(template_id): Path<Uuid>,
    Json(req): Json<UpdateTemplateRequest>,
) -> Result<Json<ApiOk<TemplateRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    if let Some(p) = req.price_cents {
        if p < 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "price_cents cannot be negative".into(),
            ));
        }
    }

    let row: TemplateRow = sqlx::query_as::<_, TemplateRow>(
        r#"
        UPDATE course_template
        SET name = COALESCE($3, name),
            description = COALESCE($4, description),
            price_cents = COALESCE($5, price_cents),
            is_active = COALESCE($6, is_active)
        WHERE template_id = $1
          AND clinic_id = $2
        RETURNING template_id, clinic_id, name, description, total_sessions,
                  price_cents, validity_days, is_active, created_at
        "#,
    )
    .bind(template_id)
    .bind(auth.clinic_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.description.as_deref())
    .bind(req.price_cents)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("course template"))?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Purchase
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CourseRow {
    pub course_id: Uuid,
    pub clinic_id: Uuid,
    pub template_id: Uuid,
    pub patient_id: Uuid,
    pub total_sessions: i32,
    pub used_sessions: i32,
    pub price_cents: i64,
    pub bill_id: Option<Uuid>,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

const COURSE_COLUMNS: &str = r#"course_id, clinic_id, template_id, patient_id, total_sessions,
               used_sessions, price_cents, bill_id, purchased_at, expires_at"#;

#[derive(Debug, Deserialize)]
pub struct PurchaseCourseRequest {
    pub patient_id: Uuid,
    pub template_id: Uuid,
}

/// Purchase = course + its bill in one transaction. The course snapshots the
/// template's sessions and price so later template edits never change what
/// was sold.
pub async fn purchase_course(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<PurchaseCourseRequest>,
) -> Result<Json<ApiOk<CourseRow>>, ApiError> {
    ensure_staff(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let template: TemplateRow = sqlx::query_as::<_, TemplateRow>(
        r#"
        SELECT template_id, clinic_id, name, description, total_sessions,
               price_cents, validity_days, is_active, created_at
        FROM course_template
        WHERE template_id = $1
          AND is_active = true
        "#,
    )
    .bind(req.template_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("course template"))?;

    if auth.role != ROLE_ADMIN && template.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Template belongs to another clinic".into(),
        ));
    }

    let patient_clinic: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT clinic_id
        FROM patient
        WHERE patient_id = $1
        "#,
    )
    .bind(req.patient_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    match patient_clinic {
        None => return Err(ApiError::not_found("patient")),
        Some(c) if c != template.clinic_id => {
            return Err(ApiError::Conflict(
                "CLINIC_MISMATCH",
                "Patient is registered at another clinic".into(),
            ));
        }
        Some(_) => {}
    }

    let bill_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO bill (clinic_id, patient_id, status, total_cents)
        VALUES ($1, $2, $3, $4)
        RETURNING bill_id
        "#,
    )
    .bind(template.clinic_id)
    .bind(req.patient_id)
    .bind(BILL_UNPAID)
    .bind(template.price_cents)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        INSERT INTO bill_item (bill_id, description, quantity, unit_price_cents)
        VALUES ($1, $2, 1, $3)
        "#,
    )
    .bind(bill_id)
    .bind(format!("Course: {}", template.name))
    .bind(template.price_cents)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let row: CourseRow = sqlx::query_as::<_, CourseRow>(&format!(
        r#"
        INSERT INTO course (clinic_id, template_id, patient_id, total_sessions,
                            used_sessions, price_cents, bill_id, expires_at)
        VALUES ($1, $2, $3, $4, 0, $5, $6,
                CASE WHEN $7::int IS NULL THEN NULL
                     ELSE now() + make_interval(days => $7) END)
        RETURNING {COURSE_COLUMNS}
        "#
    ))
    .bind(template.clinic_id)
    .bind(template.template_id)
    .bind(req.patient_id)
    .bind(template.total_sessions)
    .bind(template.price_cents)
    .bind(bill_id)
    .bind(template.validity_days)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Read
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListCoursesQuery {
    pub patient_id: Uuid,
    pub include_exhausted: Option<bool>,
}

pub async fn list_courses(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListCoursesQuery>,
) -> Result<Json<ApiOk<Vec<CourseRow>>>, ApiError> {
    ensure_staff(&auth)?;
    let include_exhausted = q.include_exhausted.unwrap_or(false);

    // Own plus family-shared courses.
    let rows: Vec<CourseRow> = sqlx::query_as::<_, CourseRow>(
        r#"
        SELECT DISTINCT ON (c.course_id)
               c.course_id, c.clinic_id, c.template_id, c.patient_id, c.total_sessions,
               c.used_sessions, c.price_cents, c.bill_id, c.purchased_at, c.expires_at
        FROM course c
        LEFT JOIN course_shared_user csu
               ON csu.course_id = c.course_id AND csu.patient_id = $1
        WHERE (c.patient_id = $1 OR csu.patient_id = $1)
          AND ($2 OR c.used_sessions < c.total_sessions)
        ORDER BY c.course_id, c.purchased_at DESC
        "#,
    )
    .bind(q.patient_id)
    .bind(include_exhausted)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

async fn load_course_scoped(
    state: &AppState,
    auth: &AuthContext,
    course_id: Uuid,
) -> Result<CourseRow, ApiError> {
    let row: CourseRow = sqlx::query_as::<_, CourseRow>(&format!(
        r#"
        SELECT {COURSE_COLUMNS}
        FROM course
        WHERE course_id = $1
        "#
    ))
    .bind(course_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("course"))?;

    if auth.role != ROLE_ADMIN && row.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Course belongs to another clinic".into(),
        ));
    }
    Ok(row)
}

pub async fn get_course(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(course_id): Path<Uuid>,
) -> Result<Json<ApiOk<CourseRow>>, ApiError> {
    ensure_staff(&auth)?;
    let row = load_course_scoped(&state, &auth, course_id).await?;
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Family sharing
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub patient_id: Uuid,
}

pub async fn share_course(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(course_id): Path<Uuid>,
    Json(req): Json<ShareRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    ensure_staff(&auth)?;
    let course = load_course_scoped(&state, &auth, course_id).await?;

    if course.patient_id == req.patient_id {
        return Err(ApiError::Conflict(
            "ALREADY_OWNER",
            "The owner does not need a share".into(),
        ));
    }

    let member_clinic: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT clinic_id
        FROM patient
        WHERE patient_id = $1
        "#,
    )
    .bind(req.patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    match member_clinic {
        None => return Err(ApiError::not_found("patient")),
        Some(c) if c != course.clinic_id => {
            return Err(ApiError::Conflict(
                "CLINIC_MISMATCH",
                "Family members must be registered at the same clinic".into(),
            ));
        }
        Some(_) => {}
    }

    sqlx::query(
        r#"
        INSERT INTO course_shared_user (course_id, patient_id)
        VALUES ($1, $2)
        ON CONFLICT (course_id, patient_id) DO NOTHING
        "#,
    )
    .bind(course_id)
    .bind(req.patient_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(OkResponse::yes()))
}

pub async fn unshare_course(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(course_id): Path<Uuid>,
    Json(req): Json<ShareRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    ensure_staff(&auth)?;
    load_course_scoped(&state, &auth, course_id).await?;

    let res = sqlx::query(
        r#"
        DELETE FROM course_shared_user
        WHERE course_id = $1
          AND patient_id = $2
        "#,
    )
    .bind(course_id)
    .bind(req.patient_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("share"));
    }

    Ok(Json(OkResponse::yes()))
}

/* ============================================================
   Manual adjustment
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct AdjustCourseRequest {
    /// Positive debits sessions, negative credits them back.
    pub delta: i32,
    pub reason: String,
}

pub async fn adjust_course(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(course_id): Path<Uuid>,
    Json(req): Json<AdjustCourseRequest>,
) -> Result<Json<ApiOk<CourseRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "reason is required".into(),
        ));
    }
    if req.delta == 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "delta cannot be zero".into(),
        ));
    }
    load_course_scoped(&state, &auth, course_id).await?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Guarded in SQL: the result must stay inside [0, total_sessions].
    let row: Option<CourseRow> = sqlx::query_as::<_, CourseRow>(&format!(
        r#"
        UPDATE course
        SET used_sessions = used_sessions + $2
        WHERE course_id = $1
          AND used_sessions + $2 >= 0
          AND used_sessions + $2 <= total_sessions
        RETURNING {COURSE_COLUMNS}
        "#
    ))
    .bind(course_id)
    .bind(req.delta)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some(row) = row else {
        return Err(ApiError::Conflict(
            "ADJUSTMENT_OUT_OF_RANGE",
            "Adjustment would push used_sessions outside 0..total_sessions".into(),
        ));
    };

    sqlx::query(
        r#"
        INSERT INTO course_adjustment (course_id, delta, reason, adjusted_by)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(course_id)
    .bind(req.delta)
    .bind(reason)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_validation() {
        assert!(validate_template(10, 500_000, Some(180)).is_ok());
        assert!(validate_template(0, 500_000, None).is_err());
        assert!(validate_template(10, -1, None).is_err());
        assert!(validate_template(10, 0, Some(0)).is_err());
    }
}
