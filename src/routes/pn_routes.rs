use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

// body_annotation.pain_pattern
pub const PAIN_CONSTANT: i16 = 0;
pub const PAIN_INTERMITTENT: i16 = 1;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pn_cases", post(create_case).get(list_cases))
        .route("/pn_cases/{case_id}", get(get_case).patch(patch_case))
        .route("/pn_cases/{case_id}/accept", post(accept_case))
        .route("/pn_cases/{case_id}/cancel", post(cancel_case))
        .route("/pn_cases/{case_id}/complete", post(complete_case))
        .route(
            "/pn_cases/{case_id}/annotations",
            get(list_annotations).post(create_annotation),
        )
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC || auth.role == ROLE_PT {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can manage PN cases".into(),
        ))
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PnCaseRow {
    pub case_id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub pt_user_id: Option<Uuid>,
    pub case_no: String,
    pub status: i16,
    pub chief_complaint: Option<String>,
    pub assessment_note: Option<String>,
    pub pain_score_before: Option<i16>,
    pub pain_score_after: Option<i16>,
    pub soap_subjective: Option<String>,
    pub soap_objective: Option<String>,
    pub soap_assessment: Option<String>,
    pub soap_plan: Option<String>,
    pub course_id: Option<Uuid>,
    pub bill_id: Option<Uuid>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const CASE_COLUMNS: &str = r#"case_id, clinic_id, patient_id, pt_user_id, case_no, status,
               chief_complaint, assessment_note, pain_score_before, pain_score_after,
               soap_subjective, soap_objective, soap_assessment, soap_plan,
               course_id, bill_id, accepted_at, completed_at, cancelled_at, created_at"#;

async fn load_case_scoped(
    state: &AppState,
    auth: &AuthContext,
    case_id: Uuid,
) -> Result<PnCaseRow, ApiError> {
    let row: PnCaseRow = sqlx::query_as::<_, PnCaseRow>(&format!(
        r#"
        SELECT {CASE_COLUMNS}
        FROM pn_case
        WHERE case_id = $1
        "#
    ))
    .bind(case_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("PN case"))?;

    if auth.role != ROLE_ADMIN && row.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "PN case belongs to another clinic".into(),
        ));
    }
    Ok(row)
}

fn validate_pain_score(score: Option<i16>) -> Result<(), ApiError> {
    if let Some(s) = score {
        if !(0..=10).contains(&s) {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "pain scores run 0..10".into(),
            ));
        }
    }
    Ok(())
}

/* ============================================================
   Create / read
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateCaseRequest {
    pub patient_id: Uuid,
    pub pt_user_id: Option<Uuid>,
    pub chief_complaint: Option<String>,
    pub course_id: Option<Uuid>,
}

pub async fn create_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCaseRequest>,
) -> Result<Json<ApiOk<PnCaseRow>>, ApiError> {
    ensure_staff(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

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

    let Some(clinic_id) = patient_clinic else {
        return Err(ApiError::not_found("patient"));
    };
    if auth.role != ROLE_ADMIN && clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Patient belongs to another clinic".into(),
        ));
    }

    // Case numbers run per clinic, issued under the clinic row lock like HN.
    let case_seq: i64 = sqlx::query_scalar(
        r#"
        UPDATE clinic
        SET next_pn = next_pn + 1
        WHERE clinic_id = $1
        RETURNING next_pn
        "#,
    )
    .bind(clinic_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    let case_no = format!("PN{case_seq:06}");

    let row: PnCaseRow = sqlx::query_as::<_, PnCaseRow>(&format!(
        r#"
        INSERT INTO pn_case (clinic_id, patient_id, pt_user_id, case_no, status,
                             chief_complaint, course_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {CASE_COLUMNS}
        "#
    ))
    .bind(clinic_id)
    .bind(req.patient_id)
    .bind(req.pt_user_id)
    .bind(&case_no)
    .bind(STATUS_PENDING)
    .bind(req.chief_complaint.as_deref().map(str::trim))
    .bind(req.course_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

pub async fn get_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<PnCaseRow>>, ApiError> {
    ensure_staff(&auth)?;
    let row = load_case_scoped(&state, &auth, case_id).await?;
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct ListCasesQuery {
    pub status: Option<i16>,
    pub patient_id: Option<Uuid>,
    pub pt_user_id: Option<Uuid>,
    pub clinic_id: Option<Uuid>,
}

pub async fn list_cases(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListCasesQuery>,
) -> Result<Json<ApiOk<Vec<PnCaseRow>>>, ApiError> {
    ensure_staff(&auth)?;

    let clinic_id = match (auth.role, q.clinic_id) {
        (ROLE_ADMIN, c) => c,
        (_, Some(c)) if c != auth.clinic_id => {
            return Err(ApiError::Forbidden(
                "FORBIDDEN",
                "Cannot list cases outside your clinic".into(),
            ));
        }
        _ => Some(auth.clinic_id),
    };

    let mut qb = QueryBuilder::new(format!("SELECT {CASE_COLUMNS} FROM pn_case WHERE 1=1"));
    if let Some(c) = clinic_id {
        qb.push(" AND clinic_id = ").push_bind(c);
    }
    if let Some(s) = q.status {
        qb.push(" AND status = ").push_bind(s);
    }
    if let Some(p) = q.patient_id {
        qb.push(" AND patient_id = ").push_bind(p);
    }
    if let Some(pt) = q.pt_user_id {
        qb.push(" AND pt_user_id = ").push_bind(pt);
    }
    qb.push(" ORDER BY created_at DESC LIMIT 100");

    let rows: Vec<PnCaseRow> = qb
        .build_query_as::<PnCaseRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   Clinical fields
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchCaseRequest {
    pub pt_user_id: Option<Uuid>,
    pub chief_complaint: Option<String>,
    pub assessment_note: Option<String>,
    pub pain_score_before: Option<i16>,
    pub pain_score_after: Option<i16>,
    pub soap_subjective: Option<String>,
    pub soap_objective: Option<String>,
    pub soap_assessment: Option<String>,
    pub soap_plan: Option<String>,
    pub course_id: Option<Uuid>,
    pub bill_id: Option<Uuid>,
}

pub async fn patch_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
    Json(req): Json<PatchCaseRequest>,
) -> Result<Json<ApiOk<PnCaseRow>>, ApiError> {
    ensure_staff(&auth)?;
    let existing = load_case_scoped(&state, &auth, case_id).await?;

    // Closed cases keep their record as written.
    if existing.status == STATUS_COMPLETED || existing.status == STATUS_CANCELLED {
        return Err(ApiError::Conflict(
            "CASE_CLOSED",
            "Completed or cancelled cases cannot be edited".into(),
        ));
    }

    validate_pain_score(req.pain_score_before)?;
    validate_pain_score(req.pain_score_after)?;

    let row: PnCaseRow = sqlx::query_as::<_, PnCaseRow>(&format!(
        r#"
        UPDATE pn_case
        SET pt_user_id = COALESCE($2, pt_user_id),
            chief_complaint = COALESCE($3, chief_complaint),
            assessment_note = COALESCE($4, assessment_note),
            pain_score_before = COALESCE($5, pain_score_before),
            pain_score_after = COALESCE($6, pain_score_after),
            soap_subjective = COALESCE($7, soap_subjective),
            soap_objective = COALESCE($8, soap_objective),
            soap_assessment = COALESCE($9, soap_assessment),
            soap_plan = COALESCE($10, soap_plan),
            course_id = COALESCE($11, course_id),
            bill_id = COALESCE($12, bill_id)
        WHERE case_id = $1
        RETURNING {CASE_COLUMNS}
        "#
    ))
    .bind(case_id)
    .bind(req.pt_user_id)
    .bind(req.chief_complaint.as_deref())
    .bind(req.assessment_note.as_deref())
    .bind(req.pain_score_before)
    .bind(req.pain_score_after)
    .bind(req.soap_subjective.as_deref())
    .bind(req.soap_objective.as_deref())
    .bind(req.soap_assessment.as_deref())
    .bind(req.soap_plan.as_deref())
    .bind(req.course_id)
    .bind(req.bill_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Status transitions — all through models::can_transition
   ============================================================ */

async fn transition_case(
    state: &AppState,
    auth: &AuthContext,
    case_id: Uuid,
    to: i16,
    assign_pt: Option<Uuid>,
) -> Result<PnCaseRow, ApiError> {
    ensure_staff(auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let current: Option<(i16, Uuid)> = sqlx::query_as(
        r#"
        SELECT status, clinic_id
        FROM pn_case
        WHERE case_id = $1
        FOR UPDATE
        "#,
    )
    .bind(case_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some((from, clinic_id)) = current else {
        return Err(ApiError::not_found("PN case"));
    };
    if auth.role != ROLE_ADMIN && clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "PN case belongs to another clinic".into(),
        ));
    }
    if !can_transition(from, to) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!(
                "cannot move case from {} to {}",
                status_to_string(from),
                status_to_string(to)
            ),
        ));
    }

    let stamp = match to {
        STATUS_ACCEPTED => "accepted_at",
        STATUS_COMPLETED => "completed_at",
        _ => "cancelled_at",
    };

    let row: PnCaseRow = sqlx::query_as::<_, PnCaseRow>(&format!(
        r#"
        UPDATE pn_case
        SET status = $2,
            {stamp} = now(),
            pt_user_id = COALESCE($3, pt_user_id)
        WHERE case_id = $1
        RETURNING {CASE_COLUMNS}
        "#
    ))
    .bind(case_id)
    .bind(to)
    .bind(assign_pt)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;
    Ok(row)
}

pub async fn accept_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<PnCaseRow>>, ApiError> {
    // A PT accepting a case takes it.
    let assign = (auth.role == ROLE_PT).then_some(auth.user_id);
    let row = transition_case(&state, &auth, case_id, STATUS_ACCEPTED, assign).await?;
    Ok(Json(ApiOk { data: row }))
}

pub async fn cancel_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<PnCaseRow>>, ApiError> {
    let row = transition_case(&state, &auth, case_id, STATUS_CANCELLED, None).await?;
    Ok(Json(ApiOk { data: row }))
}

/// Direct completion (outside the appointment flow) still demands a written
/// assessment so the clinical record is never empty.
pub async fn complete_case(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<PnCaseRow>>, ApiError> {
    ensure_staff(&auth)?;
    let existing = load_case_scoped(&state, &auth, case_id).await?;
    if existing.assessment_note.as_deref().map(str::trim).filter(|s| !s.is_empty()).is_none() {
        return Err(ApiError::BadRequest(
            "ASSESSMENT_REQUIRED",
            "Record a PT assessment before completing the case".into(),
        ));
    }
    let row = transition_case(&state, &auth, case_id, STATUS_COMPLETED, None).await?;
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Body annotations
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AnnotationRow {
    pub annotation_id: Uuid,
    pub case_id: Uuid,
    pub strokes: serde_json::Value,
    pub pain_pattern: i16,
    pub severity: i16,
    pub aggravating_factors: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAnnotationRequest {
    /// Freehand stroke data: arrays of {x, y, pressure} points.
    pub strokes: serde_json::Value,
    pub pain_pattern: i16,
    pub severity: i16,
    pub aggravating_factors: Option<String>,
}

pub fn validate_annotation(req: &CreateAnnotationRequest) -> Result<(), ApiError> {
    if !req.strokes.is_array() || req.strokes.as_array().map(Vec::len).unwrap_or(0) == 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "strokes must be a non-empty array".into(),
        ));
    }
    if req.pain_pattern != PAIN_CONSTANT && req.pain_pattern != PAIN_INTERMITTENT {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "pain_pattern must be 0 (constant) or 1 (intermittent)".into(),
        ));
    }
    if !(0..=10).contains(&req.severity) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "severity runs 0..10".into(),
        ));
    }
    Ok(())
}

pub async fn create_annotation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
    Json(req): Json<CreateAnnotationRequest>,
) -> Result<Json<ApiOk<AnnotationRow>>, ApiError> {
    ensure_staff(&auth)?;
    let case = load_case_scoped(&state, &auth, case_id).await?;
    if case.status == STATUS_CANCELLED {
        return Err(ApiError::Conflict(
            "CASE_CLOSED",
            "Cancelled cases do not take annotations".into(),
        ));
    }
    validate_annotation(&req)?;

    let row = insert_annotation(&state.db, case_id, auth.user_id, &req).await?;
    Ok(Json(ApiOk { data: row }))
}

/// Shared with the appointment completion flow, which inserts inside its own
/// transaction.
pub async fn insert_annotation<'e, E>(
    executor: E,
    case_id: Uuid,
    created_by: Uuid,
    req: &CreateAnnotationRequest,
) -> Result<AnnotationRow, ApiError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, AnnotationRow>(
        r#"
        INSERT INTO body_annotation (case_id, strokes, pain_pattern, severity,
                                     aggravating_factors, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING annotation_id, case_id, strokes, pain_pattern, severity,
                  aggravating_factors, created_by, created_at
        "#,
    )
    .bind(case_id)
    .bind(&req.strokes)
    .bind(req.pain_pattern)
    .bind(req.severity)
    .bind(req.aggravating_factors.as_deref())
    .bind(created_by)
    .fetch_one(executor)
    .await
    .map_err(ApiError::db)
}

pub async fn list_annotations(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(case_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<AnnotationRow>>>, ApiError> {
    ensure_staff(&auth)?;
    load_case_scoped(&state, &auth, case_id).await?;

    let rows: Vec<AnnotationRow> = sqlx::query_as::<_, AnnotationRow>(
        r#"
        SELECT annotation_id, case_id, strokes, pain_pattern, severity,
               aggravating_factors, created_by, created_at
        FROM body_annotation
        WHERE case_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(case_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn annotation(strokes: serde_json::Value, pattern: i16, severity: i16) -> CreateAnnotationRequest {
        CreateAnnotationRequest {
            strokes,
            pain_pattern: pattern,
            severity,
            aggravating_factors: None,
        }
    }

    #[test]
    fn annotation_needs_strokes() {
        assert!(validate_annotation(&annotation(json!([]), PAIN_CONSTANT, 5)).is_err());
        assert!(validate_annotation(&annotation(json!({"not": "array"}), PAIN_CONSTANT, 5)).is_err());
        assert!(
            validate_annotation(&annotation(
                json!([[{"x": 1.0, "y": 2.0, "pressure": 0.4}]]),
                PAIN_CONSTANT,
                5
            ))
            .is_ok()
        );
    }

    #[test]
    fn annotation_bounds() {
        let strokes = json!([[{"x": 0, "y": 0, "pressure": 1.0}]]);
        assert!(validate_annotation(&annotation(strokes.clone(), 2, 5)).is_err());
        assert!(validate_annotation(&annotation(strokes.clone(), PAIN_INTERMITTENT, 11)).is_err());
        assert!(validate_annotation(&annotation(strokes, PAIN_INTERMITTENT, 10)).is_ok());
    }

    #[test]
    fn pain_score_range() {
        assert!(validate_pain_score(None).is_ok());
        assert!(validate_pain_score(Some(0)).is_ok());
        assert!(validate_pain_score(Some(10)).is_ok());
        assert!(validate_pain_score(Some(11)).is_err());
        assert!(validate_pain_score(Some(-1)).is_err());
    }
}
