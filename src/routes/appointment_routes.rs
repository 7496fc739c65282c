use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, patch, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::SmtpConfig,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    notify::{PatientContact, gcal::EventInput},
    routes::pn_routes::{CreateAnnotationRequest, insert_annotation, validate_annotation},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", post(create_appointment))
        .route("/appointments/week", get(get_appointments_week))
        .route("/appointments/today", get(get_appointments_today))
        .route("/appointments/{appointment_id}", get(get_appointment).patch(patch_appointment))
        .route("/appointments/{appointment_id}/accept", post(accept_appointment))
        .route("/appointments/{appointment_id}/cancel", post(cancel_appointment))
        .route("/appointments/{appointment_id}/complete", post(complete_appointment))
        .route(
            "/appointments/{appointment_id}/link_patient/{patient_id}",
            post(link_walk_in_patient),
        )
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC || auth.role == ROLE_PT {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can manage appointments".into(),
        ))
    }
}

/// PTs see their own schedule; admin/clinic pick a PT explicitly.
fn resolve_schedule_pt(auth: &AuthContext, requested: Option<Uuid>) -> Result<Uuid, ApiError> {
    if auth.role == ROLE_PT {
        match requested {
            Some(id) if id != auth.user_id => Err(ApiError::Forbidden(
                "FORBIDDEN",
                "PTs can only view their own schedule".into(),
            )),
            _ => Ok(auth.user_id),
        }
    } else {
        requested.ok_or_else(|| {
            ApiError::BadRequest(
                "VALIDATION_ERROR",
                "pt_user_id is required for non-PT users".into(),
            )
        })
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AppointmentRow {
    pub appointment_id: Uuid,
    pub clinic_id: Uuid,
    pub pt_user_id: Uuid,
    pub patient_id: Option<Uuid>,
    pub walk_in_name: Option<String>,
    pub walk_in_phone: Option<String>,
    pub booking_type: i16,
    pub appointment_type: i16,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: i16,
    pub case_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub google_event_id: Option<String>,
    pub note: Option<String>,
    pub created_by_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

const APPOINTMENT_COLUMNS: &str = r#"appointment_id, clinic_id, pt_user_id, patient_id,
               walk_in_name, walk_in_phone, booking_type, appointment_type,
               start_at, end_at, status, case_id, course_id, google_event_id,
               note, created_by_user_id, created_at"#;

async fn load_appointment_scoped(
    state: &AppState,
    auth: &AuthContext,
    appointment_id: Uuid,
) -> Result<AppointmentRow, ApiError> {
    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        SELECT {APPOINTMENT_COLUMNS}
        FROM appointment
        WHERE appointment_id = $1
        "#
    ))
    .bind(appointment_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    if auth.role != ROLE_ADMIN && row.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Appointment belongs to another clinic".into(),
        ));
    }
    Ok(row)
}

fn validate_range(start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Result<(), ApiError> {
    if end_at <= start_at {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "end_at must be after start_at".into(),
        ));
    }
    Ok(())
}

/* ============================================================
   Create
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub pt_user_id: Uuid,
    pub clinic_id: Option<Uuid>,
    /// Existing patient...
    pub patient_id: Option<Uuid>,
    /// ...or walk-in identity.
    pub walk_in_name: Option<String>,
    pub walk_in_phone: Option<String>,
    pub appointment_type: Option<i16>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub case_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub note: Option<String>,
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_staff(&auth)?;
    validate_range(req.start_at, req.end_at)?;

    let clinic_id = match (auth.role, req.clinic_id) {
        (ROLE_ADMIN, Some(c)) => c,
        (ROLE_ADMIN, None) => {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "clinic_id is required for admin".into(),
            ));
        }
        (_, Some(c)) if c != auth.clinic_id => {
            return Err(ApiError::Forbidden(
                "FORBIDDEN",
                "Cannot book outside your clinic".into(),
            ));
        }
        _ => auth.clinic_id,
    };

    let appointment_type = req.appointment_type.unwrap_or(APPT_GENERAL);
    if !(APPT_GENERAL..=APPT_BODY_CHECK).contains(&appointment_type) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "appointment_type must be 0,1,2".into(),
        ));
    }

    let (booking_type, walk_in_name) = match (&req.patient_id, req.walk_in_name.as_deref().map(str::trim)) {
        (Some(_), _) => (BOOKING_OLD_PATIENT, None),
        (None, Some(name)) if !name.is_empty() => (BOOKING_WALK_IN, Some(name.to_string())),
        _ => {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "patient_id or walk_in_name is required".into(),
            ));
        }
    };

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // The PT cannot be double-booked over an open appointment.
    let clash: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT appointment_id
        FROM appointment
        WHERE pt_user_id = $1
          AND status IN ($2, $3)
          AND start_at < $5
          AND end_at > $4
        LIMIT 1
        "#,
    )
    .bind(req.pt_user_id)
    .bind(STATUS_PENDING)
    .bind(STATUS_ACCEPTED)
    .bind(req.start_at)
    .bind(req.end_at)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if clash.is_some() {
        return Err(ApiError::Conflict(
            "PT_BUSY",
            "The PT already has an appointment in this slot".into(),
        ));
    }

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        INSERT INTO appointment (clinic_id, pt_user_id, patient_id, walk_in_name, walk_in_phone,
                                 booking_type, appointment_type, start_at, end_at, status,
                                 case_id, course_id, note, created_by_user_id)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
        RETURNING {APPOINTMENT_COLUMNS}
        "#
    ))
    .bind(clinic_id)
    .bind(req.pt_user_id)
    .bind(req.patient_id)
    .bind(walk_in_name.as_deref())
    .bind(req.walk_in_phone.as_deref().map(str::trim))
    .bind(booking_type)
    .bind(appointment_type)
    .bind(req.start_at)
    .bind(req.end_at)
    .bind(STATUS_PENDING)
    .bind(req.case_id)
    .bind(req.course_id)
    .bind(req.note.as_deref())
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    // Calendar + patient notice happen after commit and never fail the call.
    sync_calendar_insert(&state, &row).await;
    notify_booked(&state, &row).await;

    // Re-read so the response carries the event id when sync succeeded.
    let row = load_appointment_scoped(&state, &auth, row.appointment_id).await?;
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Schedule views
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct WeekQuery {
    pub start: String,
    pub days: Option<i64>,
    pub pt_user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct TodayQuery {
    pub pt_user_id: Option<Uuid>,
}

async fn schedule_between(
    state: &AppState,
    pt_user_id: Uuid,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
) -> Result<Vec<AppointmentRow>, ApiError> {
    sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        SELECT {APPOINTMENT_COLUMNS}
        FROM appointment
        WHERE pt_user_id = $1
          AND start_at >= $2
          AND start_at < $3
        ORDER BY start_at ASC
        "#
    ))
    .bind(pt_user_id)
    .bind(start_ts)
    .bind(end_ts)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)
}

pub async fn get_appointments_week(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<WeekQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentRow>>>, ApiError> {
    ensure_staff(&auth)?;

    let days = q.days.unwrap_or(7);
    if !(1..=14).contains(&days) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "days must be between 1 and 14".into(),
        ));
    }
    let start_date = NaiveDate::parse_from_str(q.start.trim(), "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest("VALIDATION_ERROR", "start must be YYYY-MM-DD".into())
    })?;
    let pt_user_id = resolve_schedule_pt(&auth, q.pt_user_id)?;

    let start_ts =
        DateTime::<Utc>::from_naive_utc_and_offset(start_date.and_hms_opt(0, 0, 0).unwrap(), Utc);
    let end_ts = start_ts + chrono::Duration::days(days);

    let rows = schedule_between(&state, pt_user_id, start_ts, end_ts).await?;
    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_appointments_today(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<TodayQuery>,
) -> Result<Json<ApiOk<Vec<AppointmentRow>>>, ApiError> {
    ensure_staff(&auth)?;
    let pt_user_id = resolve_schedule_pt(&auth, q.pt_user_id)?;

    let start = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap();
    let start_ts = DateTime::<Utc>::from_naive_utc_and_offset(start, Utc);
    let end_ts = start_ts + chrono::Duration::days(1);

    let rows = schedule_between(&state, pt_user_id, start_ts, end_ts).await?;
    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_staff(&auth)?;
    let row = load_appointment_scoped(&state, &auth, appointment_id).await?;
    if auth.role == ROLE_PT && row.pt_user_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "PTs can only view their own appointments".into(),
        ));
    }
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Reschedule / edit
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchAppointmentRequest {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub course_id: Option<Uuid>,
    pub case_id: Option<Uuid>,
}

pub async fn patch_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<PatchAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_staff(&auth)?;
    let existing = load_appointment_scoped(&state, &auth, appointment_id).await?;

    if existing.status == STATUS_COMPLETED || existing.status == STATUS_CANCELLED {
        return Err(ApiError::Conflict(
            "APPOINTMENT_CLOSED",
            "Completed or cancelled appointments cannot be edited".into(),
        ));
    }

    let start_at = req.start_at.unwrap_or(existing.start_at);
    let end_at = req.end_at.unwrap_or(existing.end_at);
    validate_range(start_at, end_at)?;

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        UPDATE appointment
        SET start_at = $2,
            end_at = $3,
            note = COALESCE($4, note),
            course_id = COALESCE($5, course_id),
            case_id = COALESCE($6, case_id)
        WHERE appointment_id = $1
        RETURNING {APPOINTMENT_COLUMNS}
        "#
    ))
    .bind(appointment_id)
    .bind(start_at)
    .bind(end_at)
    .bind(req.note.as_deref())
    .bind(req.course_id)
    .bind(req.case_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    // Keep the calendar in step with the new slot.
    sync_calendar_patch(&state, &row).await;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Status transitions
   ============================================================ */

async fn transition_appointment(
    state: &AppState,
    auth: &AuthContext,
    appointment_id: Uuid,
    to: i16,
) -> Result<AppointmentRow, ApiError> {
    ensure_staff(auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let current: Option<(i16, Uuid)> = sqlx::query_as(
        r#"
        SELECT status, clinic_id
        FROM appointment
        WHERE appointment_id = $1
        FOR UPDATE
        "#,
    )
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some((from, clinic_id)) = current else {
        return Err(ApiError::not_found("appointment"));
    };
    if auth.role != ROLE_ADMIN && clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Appointment belongs to another clinic".into(),
        ));
    }
    if !can_transition(from, to) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!(
                "cannot move appointment from {} to {}",
                status_to_string(from),
                status_to_string(to)
            ),
        ));
    }

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        UPDATE appointment
        SET status = $2
        WHERE appointment_id = $1
        RETURNING {APPOINTMENT_COLUMNS}
        "#
    ))
    .bind(appointment_id)
    .bind(to)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;
    Ok(row)
}

pub async fn accept_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    let row = transition_appointment(&state, &auth, appointment_id, STATUS_ACCEPTED).await?;
    Ok(Json(ApiOk { data: row }))
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    let row = transition_appointment(&state, &auth, appointment_id, STATUS_CANCELLED).await?;
    sync_calendar_delete(&state, &row).await;
    notify_cancelled(&state, &row).await;
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Completion workflow
   ============================================================ */

#[derive(Debug, PartialEq, Eq)]
enum CompletionBranch {
    /// Flagship-clinic initial assessments capture a body annotation.
    InitialAssessment,
    /// Body checks record a standalone result, no PT assessment.
    BodyCheck,
    /// Everything else requires the PT assessment form.
    Assessment,
}

fn completion_branch(clinic_code: &str, initial_clinic: &str, appointment_type: i16) -> CompletionBranch {
    if appointment_type == APPT_BODY_CHECK {
        CompletionBranch::BodyCheck
    } else if appointment_type == APPT_INITIAL_ASSESSMENT && clinic_code == initial_clinic {
        CompletionBranch::InitialAssessment
    } else {
        CompletionBranch::Assessment
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteAppointmentRequest {
    pub annotation: Option<CreateAnnotationRequest>,
    pub assessment_note: Option<String>,
    pub pain_score_before: Option<i16>,
    pub pain_score_after: Option<i16>,
    pub soap_subjective: Option<String>,
    pub soap_objective: Option<String>,
    pub soap_assessment: Option<String>,
    pub soap_plan: Option<String>,
    /// Body-check appointments store their result here.
    pub bodycheck_result: Option<String>,
    /// Also close the linked PN case (default true when it is ACCEPTED).
    pub complete_case: Option<bool>,
}

/// The whole completion sequence runs in one transaction: annotation,
/// case update, appointment status, course debit. The original system issued
/// these as separate client calls and could strand half-finished state; here
/// a failure anywhere rolls the lot back. Calendar and patient notices go
/// out only after commit.
pub async fn complete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<CompleteAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_staff(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let appt: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        SELECT {APPOINTMENT_COLUMNS}
        FROM appointment
        WHERE appointment_id = $1
        FOR UPDATE
        "#
    ))
    .bind(appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    if auth.role != ROLE_ADMIN && appt.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Appointment belongs to another clinic".into(),
        ));
    }
    if !can_transition(appt.status, STATUS_COMPLETED) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!(
                "cannot complete an appointment in {}",
                status_to_string(appt.status)
            ),
        ));
    }

    let clinic_code: String = sqlx::query_scalar(
        r#"
        SELECT code
        FROM clinic
        WHERE clinic_id = $1
        "#,
    )
    .bind(appt.clinic_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    match completion_branch(&clinic_code, &state.initial_assessment_clinic, appt.appointment_type) {
        CompletionBranch::InitialAssessment => {
            let Some(annotation) = req.annotation.as_ref() else {
                return Err(ApiError::BadRequest(
                    "ANNOTATION_REQUIRED",
                    "Initial assessments at this clinic capture a body annotation".into(),
                ));
            };
            validate_annotation(annotation)?;
            let Some(case_id) = appt.case_id else {
                return Err(ApiError::BadRequest(
                    "CASE_REQUIRED",
                    "Link a PN case before completing an initial assessment".into(),
                ));
            };
            insert_annotation(&mut *tx, case_id, auth.user_id, annotation).await?;
        }
        CompletionBranch::BodyCheck => {
            let result = req
                .bodycheck_result
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest(
                        "BODYCHECK_RESULT_REQUIRED",
                        "Body-check appointments record their result".into(),
                    )
                })?;
            sqlx::query(
                r#"
                INSERT INTO bodycheck (appointment_id, patient_id, result, created_by)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(appointment_id)
            .bind(appt.patient_id)
            .bind(result)
            .bind(auth.user_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
        }
        CompletionBranch::Assessment => {
            let provided = req
                .assessment_note
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .is_some();
            if !provided {
                return Err(ApiError::BadRequest(
                    "ASSESSMENT_REQUIRED",
                    "Record the PT assessment before completing".into(),
                ));
            }
        }
    }

    // Fold the clinical write-up into the linked case and close it out.
    if let Some(case_id) = appt.case_id {
        let case_status: i16 = sqlx::query_scalar(
            r#"
            SELECT status
            FROM pn_case
            WHERE case_id = $1
            FOR UPDATE
            "#,
        )
        .bind(case_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(ApiError::db)?;

        sqlx::query(
            r#"
            UPDATE pn_case
            SET assessment_note = COALESCE($2, assessment_note),
                pain_score_before = COALESCE($3, pain_score_before),
                pain_score_after = COALESCE($4, pain_score_after),
                soap_subjective = COALESCE($5, soap_subjective),
                soap_objective = COALESCE($6, soap_objective),
                soap_assessment = COALESCE($7, soap_assessment),
                soap_plan = COALESCE($8, soap_plan)
            WHERE case_id = $1
            "#,
        )
        .bind(case_id)
        .bind(req.assessment_note.as_deref().map(str::trim))
        .bind(req.pain_score_before)
        .bind(req.pain_score_after)
        .bind(req.soap_subjective.as_deref())
        .bind(req.soap_objective.as_deref())
        .bind(req.soap_assessment.as_deref())
        .bind(req.soap_plan.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

        let close_case = req.complete_case.unwrap_or(true);
        if close_case && can_transition(case_status, STATUS_COMPLETED) {
            sqlx::query(
                r#"
                UPDATE pn_case
                SET status = $2, completed_at = now()
                WHERE case_id = $1
                "#,
            )
            .bind(case_id)
            .bind(STATUS_COMPLETED)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
        } else if req.complete_case == Some(true) && !can_transition(case_status, STATUS_COMPLETED) {
            return Err(ApiError::Conflict(
                "INVALID_TRANSITION",
                format!("linked case is {}", status_to_string(case_status)),
            ));
        }
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET status = $2
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(STATUS_COMPLETED)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    // Course debit is guarded: zero rows means the package is exhausted or
    // expired, and the whole completion rolls back.
    if let Some(course_id) = appt.course_id {
        let debited = sqlx::query(
            r#"
            UPDATE course
            SET used_sessions = used_sessions + 1
            WHERE course_id = $1
              AND used_sessions < total_sessions
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(course_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

        if debited.rows_affected() == 0 {
            return Err(ApiError::Conflict(
                "COURSE_EXHAUSTED",
                "The linked course has no usable sessions left".into(),
            ));
        }
    }

    tx.commit().await.map_err(ApiError::db)?;

    let row = load_appointment_scoped(&state, &auth, appointment_id).await?;
    sync_calendar_patch(&state, &row).await;
    notify_completed(&state, &row).await;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Walk-in conversion
   ============================================================ */

pub async fn link_walk_in_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((appointment_id, patient_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_staff(&auth)?;
    let existing = load_appointment_scoped(&state, &auth, appointment_id).await?;

    if existing.booking_type != BOOKING_WALK_IN {
        return Err(ApiError::Conflict(
            "NOT_WALK_IN",
            "Only walk-in appointments can be linked to a patient".into(),
        ));
    }

    let patient_clinic: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT clinic_id
        FROM patient
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    match patient_clinic {
        None => return Err(ApiError::not_found("patient")),
        Some(c) if c != existing.clinic_id => {
            return Err(ApiError::Conflict(
                "CLINIC_MISMATCH",
                "Patient is registered at another clinic".into(),
            ));
        }
        Some(_) => {}
    }

    let row: AppointmentRow = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"
        UPDATE appointment
        SET patient_id = $2,
            booking_type = $3
        WHERE appointment_id = $1
        RETURNING {APPOINTMENT_COLUMNS}
        "#
    ))
    .bind(appointment_id)
    .bind(patient_id)
    .bind(BOOKING_OLD_PATIENT)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Post-commit side effects (best-effort)
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
struct ClinicNotifyRow {
    name: String,
    smtp_host: Option<String>,
    smtp_port: Option<i32>,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    smtp_from_email: Option<String>,
    smtp_from_name: Option<String>,
}

impl ClinicNotifyRow {
    fn smtp_override(&self) -> Option<SmtpConfig> {
        match (&self.smtp_host, &self.smtp_username, &self.smtp_password, &self.smtp_from_email) {
            (Some(host), Some(username), Some(password), Some(from_email)) => Some(SmtpConfig {
                host: host.clone(),
                port: self.smtp_port.unwrap_or(587) as u16,
                username: username.clone(),
                password: password.clone(),
                from_email: from_email.clone(),
                from_name: self.smtp_from_name.clone().unwrap_or_else(|| self.name.clone()),
            }),
            _ => None,
        }
    }
}

async fn clinic_notify_row(state: &AppState, clinic_id: Uuid) -> Option<ClinicNotifyRow> {
    sqlx::query_as::<_, ClinicNotifyRow>(
        r#"
        SELECT name, smtp_host, smtp_port, smtp_username, smtp_password,
               smtp_from_email, smtp_from_name
        FROM clinic
        WHERE clinic_id = $1
        "#,
    )
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
}

async fn patient_contact(state: &AppState, patient_id: Uuid) -> Option<(PatientContact, String)> {
    #[derive(sqlx::FromRow)]
    struct Row {
        email: Option<String>,
        line_user_id: Option<String>,
        first_name: String,
        last_name: String,
    }
    let row: Row = sqlx::query_as(
        r#"
        SELECT email, line_user_id, first_name, last_name
        FROM patient
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;

    Some((
        PatientContact {
            patient_id,
            email: row.email,
            line_user_id: row.line_user_id,
        },
        format!("{} {}", row.first_name, row.last_name),
    ))
}

fn event_for(row: &AppointmentRow, patient_name: &str, clinic_name: &str) -> EventInput {
    let state_tag = match row.status {
        STATUS_COMPLETED => " (completed)",
        STATUS_CANCELLED => " (cancelled)",
        _ => "",
    };
    EventInput {
        summary: format!("PT: {patient_name}{state_tag}"),
        description: row.note.clone().or_else(|| Some(clinic_name.to_string())),
        start: row.start_at,
        end: row.end_at,
    }
}

async fn sync_calendar_insert(state: &AppState, row: &AppointmentRow) {
    let Some(gcal) = state.notifier.calendar() else { return };
    let Some(patient_id) = row.patient_id else { return };
    let Some((_, patient_name)) = patient_contact(state, patient_id).await else { return };
    let clinic_name = clinic_notify_row(state, row.clinic_id)
        .await
        .map(|c| c.name)
        .unwrap_or_default();

    let result = gcal
        .insert_event(&event_for(row, &patient_name, &clinic_name))
        .await;
    match &result {
        Ok(event_id) => {
            let _ = sqlx::query(
                r#"
                UPDATE appointment
                SET google_event_id = $2
                WHERE appointment_id = $1
                "#,
            )
            .bind(row.appointment_id)
            .bind(event_id)
            .execute(&state.db)
            .await;
        }
        Err(e) => tracing::warn!("calendar insert failed: {e}"),
    }
    state
        .notifier
        .log_calendar(&state.db, row.clinic_id, patient_id, &result.map(|_| ()))
        .await;
}

async fn sync_calendar_patch(state: &AppState, row: &AppointmentRow) {
    let Some(gcal) = state.notifier.calendar() else { return };
    let Some(event_id) = row.google_event_id.as_deref() else { return };
    let Some(patient_id) = row.patient_id else { return };
    let Some((_, patient_name)) = patient_contact(state, patient_id).await else { return };
    let clinic_name = clinic_notify_row(state, row.clinic_id)
        .await
        .map(|c| c.name)
        .unwrap_or_default();

    let result = gcal
        .patch_event(event_id, &event_for(row, &patient_name, &clinic_name))
        .await;
    if let Err(e) = &result {
        tracing::warn!("calendar patch failed: {e}");
    }
    state
        .notifier
        .log_calendar(&state.db, row.clinic_id, patient_id, &result)
        .await;
}

async fn sync_calendar_delete(state: &AppState, row: &AppointmentRow) {
    let Some(gcal) = state.notifier.calendar() else { return };
    let Some(event_id) = row.google_event_id.as_deref() else { return };
    if let Err(e) = gcal.delete_event(event_id).await {
        tracing::warn!("calendar delete failed: {e}");
    }
}

async fn notify_patient(state: &AppState, row: &AppointmentRow, subject: &str) {
    let Some(patient_id) = row.patient_id else { return };
    let Some((contact, patient_name)) = patient_contact(state, patient_id).await else { return };
    let clinic = clinic_notify_row(state, row.clinic_id).await;
    let clinic_name = clinic.as_ref().map(|c| c.name.clone()).unwrap_or_default();
    let smtp_override = clinic.as_ref().and_then(ClinicNotifyRow::smtp_override);

    let when = row.start_at.format("%Y-%m-%d %H:%M").to_string();
    let html_body = crate::notify::email::appointment_email_body(
        &patient_name,
        &clinic_name,
        &when,
        row.note.as_deref(),
    );
    let line_text = format!("{clinic_name}: {when}");

    state
        .notifier
        .dispatch_patient(
            &state.db,
            row.clinic_id,
            smtp_override.as_ref(),
            &contact,
            subject,
            &html_body,
            &line_text,
        )
        .await;
}

async fn notify_booked(state: &AppState, row: &AppointmentRow) {
    notify_patient(state, row, "Your physiotherapy appointment is booked").await;
}

async fn notify_cancelled(state: &AppState, row: &AppointmentRow) {
    notify_patient(state, row, "Your physiotherapy appointment was cancelled").await;
}

async fn notify_completed(state: &AppState, row: &AppointmentRow) {
    notify_patient(state, row, "Thank you for visiting — session completed").await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_selection_matches_the_clinic_rules() {
        // Flagship clinic, initial assessment -> annotation flow
        assert_eq!(
            completion_branch("CL001", "CL001", APPT_INITIAL_ASSESSMENT),
            CompletionBranch::InitialAssessment
        );
        // Same appointment type elsewhere -> plain assessment
        assert_eq!(
            completion_branch("CL002", "CL001", APPT_INITIAL_ASSESSMENT),
            CompletionBranch::Assessment
        );
        // Body check wins regardless of clinic
        assert_eq!(
            completion_branch("CL001", "CL001", APPT_BODY_CHECK),
            CompletionBranch::BodyCheck
        );
        assert_eq!(
            completion_branch("CL002", "CL001", APPT_GENERAL),
            CompletionBranch::Assessment
        );
    }

    #[test]
    fn range_validation() {
        let t0 = Utc::now();
        assert!(validate_range(t0, t0 + chrono::Duration::minutes(30)).is_ok());
        assert!(validate_range(t0, t0).is_err());
        assert!(validate_range(t0, t0 - chrono::Duration::minutes(1)).is_err());
    }
}
