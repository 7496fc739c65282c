use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

// loyalty_transaction.kind
pub const LTX_EARN: i16 = 0;
pub const LTX_REDEEM: i16 = 1;
pub const LTX_ADJUST: i16 = 2;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/loyalty/members/{patient_id}", get(get_member))
        .route("/loyalty/members/{patient_id}/transactions", get(list_transactions))
        .route("/loyalty/gifts", get(list_gifts).post(create_gift))
        .route("/loyalty/gifts/{gift_id}", patch(update_gift))
        .route("/loyalty/redeem", post(redeem_gift))
        .route("/loyalty/adjust", post(adjust_points))
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC || auth.role == ROLE_PT {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can access loyalty records".into(),
        ))
    }
}

fn ensure_admin_or_clinic(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/clinic can do this".into(),
        ))
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MemberRow {
    pub patient_id: Uuid,
    pub tier: i16,
    pub points_balance: i64,
    pub lifetime_spend_cents: i64,
    pub enrolled_at: DateTime<Utc>,
}

/// Enrollment is implicit: the first touch creates the member row.
pub async fn ensure_member_tx(
    tx: &mut Transaction<'_, Postgres>,
    patient_id: Uuid,
) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        INSERT INTO loyalty_member (patient_id)
        VALUES ($1)
        ON CONFLICT (patient_id) DO NOTHING
        "#,
    )
    .bind(patient_id)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct MemberData {
    pub tier_name: String,
    #[serde(flatten)]
    pub member: MemberRow,
}

pub async fn get_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<MemberData>>, ApiError> {
    ensure_staff(&auth)?;

    let exists: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT patient_id
        FROM patient
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    if exists.is_none() {
        return Err(ApiError::not_found("patient"));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    ensure_member_tx(&mut tx, patient_id).await?;
    let member: MemberRow = sqlx::query_as::<_, MemberRow>(
        r#"
        SELECT patient_id, tier, points_balance, lifetime_spend_cents, enrolled_at
        FROM loyalty_member
        WHERE patient_id = $1
        "#,
    )
    .bind(patient_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;
    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: MemberData {
            tier_name: tier_to_string(member.tier),
            member,
        },
    }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TransactionRow {
    pub transaction_id: Uuid,
    pub patient_id: Uuid,
    pub kind: i16,
    pub points: i64,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<TransactionRow>>>, ApiError> {
    ensure_staff(&auth)?;

    let rows: Vec<TransactionRow> = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT transaction_id, patient_id, kind, points, note, created_at
        FROM loyalty_transaction
        WHERE patient_id = $1
        ORDER BY created_at DESC
        LIMIT 200
        "#,
    )
    .bind(patient_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   Gift catalog
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct GiftRow {
    pub gift_id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub points_cost: i64,
    pub stock: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn list_gifts(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<GiftRow>>>, ApiError> {
    ensure_staff(&auth)?;

    let rows: Vec<GiftRow> = sqlx::query_as::<_, GiftRow>(
        r#"
        SELECT gift_id, clinic_id, name, points_cost, stock, is_active, created_at
        FROM gift_card
        WHERE clinic_id = $1
          AND is_active = true
        ORDER BY points_cost ASC
        "#,
    )
    .bind(auth.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct CreateGiftRequest {
    pub name: String,
    pub points_cost: i64,
    pub stock: i32,
}

pub async fn create_gift(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateGiftRequest>,
) -> Result<Json<ApiOk<GiftRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "name is required".into()));
    }
    if req.points_cost <= 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "points_cost must be positive".into(),
        ));
    }
    if req.stock < 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "stock cannot be negative".into(),
        ));
    }

    let row: GiftRow = sqlx::query_as::<_, GiftRow>(
        r#"
        INSERT INTO gift_card (clinic_id, name, points_cost, stock)
        VALUES ($1, $2, $3, $4)
        RETURNING gift_id, clinic_id, name, points_cost, stock, is_active, created_at
        "#,
    )
    .bind(auth.clinic_id)
    .bind(name)
    .bind(req.points_cost)
    .bind(req.stock)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateGiftRequest {
    pub name: Option<String>,
    pub points_cost: Option<i64>,
    pub stock: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_gift(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(gift_id): Path<Uuid>,
    Json(req): Json<UpdateGiftRequest>,
) -> Result<Json<ApiOk<GiftRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    if let Some(p) = req.points_cost {
        if p <= 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "points_cost must be positive".into(),
            ));
        }
    }
    if let Some(s) = req.stock {
        if s < 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "stock cannot be negative".into(),
            ));
        }
    }

    let row: GiftRow = sqlx::query_as::<_, GiftRow>(
        r#"
        UPDATE gift_card
        SET name = COALESCE($3, name),
            points_cost = COALESCE($4, points_cost),
            stock = COALESCE($5, stock),
            is_active = COALESCE($6, is_active)
        WHERE gift_id = $1
          AND clinic_id = $2
        RETURNING gift_id, clinic_id, name, points_cost, stock, is_active, created_at
        "#,
    )
    .bind(gift_id)
    .bind(auth.clinic_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.points_cost)
    .bind(req.stock)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("gift"))?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Redemption
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub patient_id: Uuid,
    pub gift_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RedeemData {
    pub redemption_id: Uuid,
    pub points_spent: i64,
    pub points_balance: i64,
}

/// Point debit, stock decrement, redemption record and ledger row all commit
/// together or not at all.
pub async fn redeem_gift(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<ApiOk<RedeemData>>, ApiError> {
    ensure_staff(&auth)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let gift: Option<(i64, i32, bool, Uuid)> = sqlx::query_as(
        r#"
        SELECT points_cost, stock, is_active, clinic_id
        FROM gift_card
        WHERE gift_id = $1
        FOR UPDATE
        "#,
    )
    .bind(req.gift_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some((points_cost, stock, is_active, gift_clinic)) = gift else {
        return Err(ApiError::not_found("gift"));
    };
    if auth.role != ROLE_ADMIN && gift_clinic != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Gift belongs to another clinic".into(),
        ));
    }
    if !is_active || stock <= 0 {
        return Err(ApiError::Conflict(
            "GIFT_UNAVAILABLE",
            "Gift is inactive or out of stock".into(),
        ));
    }

    ensure_member_tx(&mut tx, req.patient_id).await?;

    // Balance guard in SQL: zero rows means not enough points.
    let balance: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE loyalty_member
        SET points_balance = points_balance - $2
        WHERE patient_id = $1
          AND points_balance >= $2
        RETURNING points_balance
        "#,
    )
    .bind(req.patient_id)
    .bind(points_cost)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some(points_balance) = balance else {
        return Err(ApiError::Conflict(
            "INSUFFICIENT_POINTS",
            "The member does not have enough points".into(),
        ));
    };

    sqlx::query(
        r#"
        UPDATE gift_card
        SET stock = stock - 1
        WHERE gift_id = $1
        "#,
    )
    .bind(req.gift_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let redemption_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO gift_redemption (gift_id, patient_id, points_spent, redeemed_by)
        VALUES ($1, $2, $3, $4)
        RETURNING redemption_id
        "#,
    )
    .bind(req.gift_id)
    .bind(req.patient_id)
    .bind(points_cost)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        INSERT INTO loyalty_transaction (patient_id, kind, points, note)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(req.patient_id)
    .bind(LTX_REDEEM)
    .bind(-points_cost)
    .bind(format!("Redemption {redemption_id}"))
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: RedeemData {
            redemption_id,
            points_spent: points_cost,
            points_balance,
        },
    }))
}

/* ============================================================
   Manual adjustment
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct AdjustPointsRequest {
    pub patient_id: Uuid,
    pub points: i64,
    pub note: String,
}

pub async fn adjust_points(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<AdjustPointsRequest>,
) -> Result<Json<ApiOk<MemberRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    if req.points == 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "points cannot be zero".into(),
        ));
    }
    let note = req.note.trim();
    if note.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "note is required".into(),
        ));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;
    ensure_member_tx(&mut tx, req.patient_id).await?;

    let member: Option<MemberRow> = sqlx::query_as::<_, MemberRow>(
        r#"
        UPDATE loyalty_member
        SET points_balance = points_balance + $2
        WHERE patient_id = $1
          AND points_balance + $2 >= 0
        RETURNING patient_id, tier, points_balance, lifetime_spend_cents, enrolled_at
        "#,
    )
    .bind(req.patient_id)
    .bind(req.points)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some(member) = member else {
        return Err(ApiError::Conflict(
            "INSUFFICIENT_POINTS",
            "Adjustment would push the balance negative".into(),
        ));
    };

    sqlx::query(
        r#"
        INSERT INTO loyalty_transaction (patient_id, kind, points, note)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(req.patient_id)
    .bind(LTX_ADJUST)
    .bind(req.points)
    .bind(note)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: member }))
}
