use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    pthn,
    thai_id,
};

// patient.status
const PATIENT_ACTIVE: i16 = 0;
const PATIENT_ARCHIVED: i16 = 1;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", post(create_patient).get(search_patients))
        .route("/patients/{patient_id}", get(get_patient).patch(update_patient))
        .route("/patients/{patient_id}/summary", get(get_patient_summary))
        .route("/patients/{patient_id}/archive", post(archive_patient))
        .route("/patients/{patient_id}/restore", post(restore_patient))
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC || auth.role == ROLE_PT {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can manage patients".into(),
        ))
    }
}

/// Staff work inside their clinic; admins may target any clinic.
fn scope_clinic(auth: &AuthContext, requested: Option<Uuid>) -> Result<Uuid, ApiError> {
    match (auth.role, requested) {
        (ROLE_ADMIN, Some(c)) => Ok(c),
        (ROLE_ADMIN, None) => Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "clinic_id is required for admin".into(),
        )),
        (_, Some(c)) if c != auth.clinic_id => Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Cannot work outside your clinic".into(),
        )),
        _ => Ok(auth.clinic_id),
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PatientRow {
    pub patient_id: Uuid,
    pub clinic_id: Uuid,
    pub hn: i64,
    pub pthn: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<chrono::NaiveDate>,
    pub gender: i16,
    pub citizen_id: Option<String>,
    pub passport_no: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub line_user_id: Option<String>,
    pub address: Option<String>,
    pub status: i16,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

const PATIENT_COLUMNS: &str = r#"patient_id, clinic_id, hn, pthn, first_name, last_name,
               birth_date, gender, citizen_id, passport_no, phone, email,
               line_user_id, address, status, created_at"#;

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub clinic_id: Option<Uuid>,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<chrono::NaiveDate>,
    pub gender: i16, // 0 unspecified, 1 male, 2 female
    pub citizen_id: Option<String>,
    pub passport_no: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub line_user_id: Option<String>,
    pub address: Option<String>,
}

fn validate_identity(
    citizen_id: Option<&str>,
    passport_no: Option<&str>,
) -> Result<(Option<String>, Option<String>), ApiError> {
    let citizen = citizen_id.map(str::trim).filter(|s| !s.is_empty());
    let passport = passport_no.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty());

    if citizen.is_none() && passport.is_none() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "citizen_id or passport_no is required".into(),
        ));
    }
    if let Some(cid) = citizen {
        if !thai_id::is_valid_citizen_id(cid) {
            return Err(ApiError::BadRequest(
                "INVALID_CITIZEN_ID",
                "citizen_id failed the checksum".into(),
            ));
        }
    }
    if let Some(p) = passport.as_deref() {
        if !thai_id::is_valid_passport(p) {
            return Err(ApiError::BadRequest(
                "INVALID_PASSPORT",
                "passport_no has an unexpected format".into(),
            ));
        }
    }
    Ok((citizen.map(str::to_string), passport))
}

pub async fn create_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    ensure_staff(&auth)?;
    let clinic_id = scope_clinic(&auth, req.clinic_id)?;

    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "first_name and last_name are required".into(),
        ));
    }
    if !(0..=2).contains(&req.gender) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "gender must be 0,1,2".into(),
        ));
    }
    let (citizen_id, passport_no) =
        validate_identity(req.citizen_id.as_deref(), req.passport_no.as_deref())?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    if let Some(cid) = citizen_id.as_deref() {
        let dup: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT patient_id
            FROM patient
            WHERE clinic_id = $1 AND citizen_id = $2
            "#,
        )
        .bind(clinic_id)
        .bind(cid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?;
        if dup.is_some() {
            return Err(ApiError::Conflict(
                "PATIENT_EXISTS",
                "A patient with this citizen_id is already registered".into(),
            ));
        }
    }

    // HN: per-clinic running number, issued under the clinic row lock.
    let hn: i64 = sqlx::query_scalar(
        r#"
        UPDATE clinic
        SET next_hn = next_hn + 1
        WHERE clinic_id = $1
        RETURNING next_hn
        "#,
    )
    .bind(clinic_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    let year = chrono::Utc::now().year();
    let pthn_code = pthn::next_pthn(&mut tx, clinic_id, year).await?;

    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        INSERT INTO patient (clinic_id, hn, pthn, first_name, last_name, birth_date, gender,
                             citizen_id, passport_no, phone, email, line_user_id, address, status)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(clinic_id)
    .bind(hn)
    .bind(&pthn_code)
    .bind(first_name)
    .bind(last_name)
    .bind(req.birth_date)
    .bind(req.gender)
    .bind(citizen_id.as_deref())
    .bind(passport_no.as_deref())
    .bind(req.phone.as_deref().map(str::trim))
    .bind(req.email.as_deref().map(str::trim))
    .bind(req.line_user_id.as_deref())
    .bind(req.address.as_deref())
    .bind(PATIENT_ACTIVE)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

async fn load_patient_scoped(
    state: &AppState,
    auth: &AuthContext,
    patient_id: Uuid,
) -> Result<PatientRow, ApiError> {
    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        SELECT {PATIENT_COLUMNS}
        FROM patient
        WHERE patient_id = $1
        "#
    ))
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("patient"))?;

    if auth.role != ROLE_ADMIN && row.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Patient belongs to another clinic".into(),
        ));
    }
    Ok(row)
}

pub async fn get_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    ensure_staff(&auth)?;
    let row = load_patient_scoped(&state, &auth, patient_id).await?;
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub include_archived: Option<bool>,
}

pub async fn search_patients(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<ApiOk<Vec<PatientRow>>>, ApiError> {
    ensure_staff(&auth)?;
    let clinic_id = scope_clinic(&auth, q.clinic_id)?;
    let include_archived = q.include_archived.unwrap_or(false);

    let query = q.query.unwrap_or_default().trim().to_string();
    let rows: Vec<PatientRow> = if query.is_empty() {
        sqlx::query_as::<_, PatientRow>(&format!(
            r#"
            SELECT {PATIENT_COLUMNS}
            FROM patient
            WHERE clinic_id = $1
              AND ($2 OR status = {PATIENT_ACTIVE})
            ORDER BY created_at DESC
            LIMIT 50
            "#
        ))
        .bind(clinic_id)
        .bind(include_archived)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?
    } else {
        let like = format!("%{query}%");
        sqlx::query_as::<_, PatientRow>(&format!(
            r#"
            SELECT {PATIENT_COLUMNS}
            FROM patient
            WHERE clinic_id = $1
              AND ($2 OR status = {PATIENT_ACTIVE})
              AND (pthn ILIKE $3
                OR first_name ILIKE $3
                OR last_name ILIKE $3
                OR phone ILIKE $3
                OR citizen_id ILIKE $3)
            ORDER BY created_at DESC
            LIMIT 50
            "#
        ))
        .bind(clinic_id)
        .bind(include_archived)
        .bind(like)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?
    };

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<chrono::NaiveDate>,
    pub gender: Option<i16>,
    pub citizen_id: Option<String>,
    pub passport_no: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub line_user_id: Option<String>,
    pub address: Option<String>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    ensure_staff(&auth)?;
    let existing = load_patient_scoped(&state, &auth, patient_id).await?;

    let first_name = match req.first_name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.first_name.clone(),
    };
    let last_name = match req.last_name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.last_name.clone(),
    };
    let gender = req.gender.unwrap_or(existing.gender);
    if !(0..=2).contains(&gender) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "gender must be 0,1,2".into(),
        ));
    }

    // Identity fields are replace-only, never cleared: losing the id that
    // registration was keyed on would orphan the HN.
    let citizen_id = match req.citizen_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(cid) => {
            if !thai_id::is_valid_citizen_id(cid) {
                return Err(ApiError::BadRequest(
                    "INVALID_CITIZEN_ID",
                    "citizen_id failed the checksum".into(),
                ));
            }
            Some(cid.to_string())
        }
        None => existing.citizen_id.clone(),
    };
    let passport_no = match req.passport_no.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(p) => {
            let p = p.to_uppercase();
            if !thai_id::is_valid_passport(&p) {
                return Err(ApiError::BadRequest(
                    "INVALID_PASSPORT",
                    "passport_no has an unexpected format".into(),
                ));
            }
            Some(p)
        }
        None => existing.passport_no.clone(),
    };

    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        UPDATE patient
        SET first_name = $2,
            last_name = $3,
            birth_date = COALESCE($4, birth_date),
            gender = $5,
            citizen_id = $6,
            passport_no = $7,
            phone = COALESCE($8, phone),
            email = COALESCE($9, email),
            line_user_id = COALESCE($10, line_user_id),
            address = COALESCE($11, address),
            updated_at = now()
        WHERE patient_id = $1
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(patient_id)
    .bind(&first_name)
    .bind(&last_name)
    .bind(req.birth_date)
    .bind(gender)
    .bind(citizen_id.as_deref())
    .bind(passport_no.as_deref())
    .bind(req.phone.as_deref().map(str::trim))
    .bind(req.email.as_deref().map(str::trim))
    .bind(req.line_user_id.as_deref())
    .bind(req.address.as_deref())
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

async fn set_patient_status(
    state: &AppState,
    auth: &AuthContext,
    patient_id: Uuid,
    status: i16,
) -> Result<PatientRow, ApiError> {
    ensure_staff(auth)?;
    load_patient_scoped(state, auth, patient_id).await?;

    sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        UPDATE patient
        SET status = $2, updated_at = now()
        WHERE patient_id = $1
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(patient_id)
    .bind(status)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)
}

pub async fn archive_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    let row = set_patient_status(&state, &auth, patient_id, PATIENT_ARCHIVED).await?;
    Ok(Json(ApiOk { data: row }))
}

pub async fn restore_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    let row = set_patient_status(&state, &auth, patient_id, PATIENT_ACTIVE).await?;
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Summary: the front-desk overview card
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OpenCaseRow {
    pub case_id: Uuid,
    pub case_no: String,
    pub status: i16,
    pub chief_complaint: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ActiveCourseRow {
    pub course_id: Uuid,
    pub name: String,
    pub total_sessions: i32,
    pub used_sessions: i32,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub is_shared: bool,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct LoyaltySummaryRow {
    pub tier: i16,
    pub points_balance: i64,
    pub lifetime_spend_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct PatientSummaryData {
    pub patient: PatientRow,
    pub open_cases: Vec<OpenCaseRow>,
    pub active_courses: Vec<ActiveCourseRow>,
    pub loyalty: Option<LoyaltySummaryRow>,
}

pub async fn get_patient_summary(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientSummaryData>>, ApiError> {
    ensure_staff(&auth)?;
    let patient = load_patient_scoped(&state, &auth, patient_id).await?;

    let open_cases: Vec<OpenCaseRow> = sqlx::query_as::<_, OpenCaseRow>(
        r#"
        SELECT case_id, case_no, status, chief_complaint, created_at
        FROM pn_case
        WHERE patient_id = $1
          AND status IN ($2, $3)
        ORDER BY created_at DESC
        "#,
    )
    .bind(patient_id)
    .bind(STATUS_PENDING)
    .bind(STATUS_ACCEPTED)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    // Own courses plus ones shared with this patient.
    let active_courses: Vec<ActiveCourseRow> = sqlx::query_as::<_, ActiveCourseRow>(
        r#"
        SELECT c.course_id, ct.name, c.total_sessions, c.used_sessions, c.expires_at,
               (c.patient_id <> $1) AS is_shared
        FROM course c
        JOIN course_template ct ON ct.template_id = c.template_id
        LEFT JOIN course_shared_user csu
               ON csu.course_id = c.course_id AND csu.patient_id = $1
        WHERE (c.patient_id = $1 OR csu.patient_id = $1)
          AND c.used_sessions < c.total_sessions
          AND (c.expires_at IS NULL OR c.expires_at > now())
        ORDER BY c.purchased_at DESC
        "#,
    )
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let loyalty: Option<LoyaltySummaryRow> = sqlx::query_as::<_, LoyaltySummaryRow>(
        r#"
        SELECT tier, points_balance, lifetime_spend_cents
        FROM loyalty_member
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: PatientSummaryData {
            patient,
            open_cases,
            active_courses,
            loyalty,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_citizen_or_passport() {
        assert!(validate_identity(None, None).is_err());
        assert!(validate_identity(Some("  "), Some("")).is_err());
    }

    #[test]
    fn identity_accepts_valid_passport_alone() {
        let (cid, passport) = validate_identity(None, Some("aa1234567")).unwrap();
        assert!(cid.is_none());
        assert_eq!(passport.as_deref(), Some("AA1234567"));
    }

    #[test]
    fn identity_rejects_bad_checksum() {
        assert!(validate_identity(Some("1234567890123"), None).is_err());
    }
}
