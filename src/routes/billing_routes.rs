use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    routes::loyalty_routes::{LTX_EARN, ensure_member_tx},
};

// bill.status
pub const BILL_UNPAID: i16 = 0;
pub const BILL_PAID: i16 = 1;
pub const BILL_VOID: i16 = 2;

// payment.method
pub const PAY_CASH: i16 = 0;
pub const PAY_CARD: i16 = 1;
pub const PAY_TRANSFER: i16 = 2;

/// One loyalty point per 100 THB paid.
const SATANG_PER_POINT: i64 = 10_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bills", post(create_bill).get(list_bills))
        .route("/bills/{bill_id}", get(get_bill))
        .route("/bills/{bill_id}/pay", post(pay_bill))
        .route("/bills/{bill_id}/void", post(void_bill))
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC || auth.role == ROLE_PT {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can manage billing".into(),
        ))
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct BillRow {
    pub bill_id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub case_id: Option<Uuid>,
    pub status: i16,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct BillItemRow {
    pub bill_item_id: Uuid,
    pub bill_id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PaymentRow {
    pub payment_id: Uuid,
    pub bill_id: Uuid,
    pub amount_cents: i64,
    pub method: i16,
    pub received_by: Uuid,
    pub created_at: DateTime<Utc>,
}

const BILL_COLUMNS: &str =
    r#"bill_id, clinic_id, patient_id, case_id, status, total_cents, created_at, paid_at"#;

async fn load_bill_scoped(
    state: &AppState,
    auth: &AuthContext,
    bill_id: Uuid,
) -> Result<BillRow, ApiError> {
    let row: BillRow = sqlx::query_as::<_, BillRow>(&format!(
        r#"
        SELECT {BILL_COLUMNS}
        FROM bill
        WHERE bill_id = $1
        "#
    ))
    .bind(bill_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("bill"))?;

    if auth.role != ROLE_ADMIN && row.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Bill belongs to another clinic".into(),
        ));
    }
    Ok(row)
}

/* ============================================================
   Create
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateBillItem {
    pub description: String,
    pub quantity: Option<i32>,
    pub unit_price_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateBillRequest {
    pub patient_id: Uuid,
    pub case_id: Option<Uuid>,
    pub items: Vec<CreateBillItem>,
}

fn bill_total(items: &[CreateBillItem]) -> Result<i64, ApiError> {
    if items.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "a bill needs at least one item".into(),
        ));
    }
    let mut total: i64 = 0;
    for it in items {
        let qty = it.quantity.unwrap_or(1);
        if qty <= 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "quantity must be positive".into(),
            ));
        }
        if it.unit_price_cents < 0 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "unit_price_cents cannot be negative".into(),
            ));
        }
        if it.description.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "item description is required".into(),
            ));
        }
        total += qty as i64 * it.unit_price_cents;
    }
    Ok(total)
}

pub async fn create_bill(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateBillRequest>,
) -> Result<Json<ApiOk<BillRow>>, ApiError> {
    ensure_staff(&auth)?;
    let total = bill_total(&req.items)?;

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

    let bill: BillRow = sqlx::query_as::<_, BillRow>(&format!(
        r#"
        INSERT INTO bill (clinic_id, patient_id, case_id, status, total_cents)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {BILL_COLUMNS}
        "#
    ))
    .bind(clinic_id)
    .bind(req.patient_id)
    .bind(req.case_id)
    .bind(BILL_UNPAID)
    .bind(total)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    for it in &req.items {
        sqlx::query(
            r#"
            INSERT INTO bill_item (bill_id, description, quantity, unit_price_cents)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(bill.bill_id)
        .bind(it.description.trim())
        .bind(it.quantity.unwrap_or(1))
        .bind(it.unit_price_cents)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    if let Some(case_id) = req.case_id {
        sqlx::query(
            r#"
            UPDATE pn_case
            SET bill_id = $2
            WHERE case_id = $1
            "#,
        )
        .bind(case_id)
        .bind(bill.bill_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;
    }

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: bill }))
}

/* ============================================================
   Read
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct BillDetailData {
    pub bill: BillRow,
    pub items: Vec<BillItemRow>,
    pub payments: Vec<PaymentRow>,
}

pub async fn get_bill(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<ApiOk<BillDetailData>>, ApiError> {
    ensure_staff(&auth)?;
    let bill = load_bill_scoped(&state, &auth, bill_id).await?;

    let items: Vec<BillItemRow> = sqlx::query_as::<_, BillItemRow>(
        r#"
        SELECT bill_item_id, bill_id, description, quantity, unit_price_cents
        FROM bill_item
        WHERE bill_id = $1
        ORDER BY bill_item_id ASC
        "#,
    )
    .bind(bill_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let payments: Vec<PaymentRow> = sqlx::query_as::<_, PaymentRow>(
        r#"
        SELECT payment_id, bill_id, amount_cents, method, received_by, created_at
        FROM payment
        WHERE bill_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(bill_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: BillDetailData { bill, items, payments },
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListBillsQuery {
    pub patient_id: Option<Uuid>,
    pub status: Option<i16>,
}

pub async fn list_bills(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListBillsQuery>,
) -> Result<Json<ApiOk<Vec<BillRow>>>, ApiError> {
    ensure_staff(&auth)?;

    let rows: Vec<BillRow> = sqlx::query_as::<_, BillRow>(&format!(
        r#"
        SELECT {BILL_COLUMNS}
        FROM bill
        WHERE clinic_id = $1
          AND ($2::uuid IS NULL OR patient_id = $2)
          AND ($3::smallint IS NULL OR status = $3)
        ORDER BY created_at DESC
        LIMIT 100
        "#
    ))
    .bind(auth.clinic_id)
    .bind(q.patient_id)
    .bind(q.status)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

/* ============================================================
   Payment + loyalty accrual
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PayBillRequest {
    pub method: i16,
    /// Defaults to the full bill amount; partial payments are not supported.
    pub amount_cents: Option<i64>,
}

pub async fn pay_bill(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(bill_id): Path<Uuid>,
    Json(req): Json<PayBillRequest>,
) -> Result<Json<ApiOk<BillRow>>, ApiError> {
    ensure_staff(&auth)?;

    if !(PAY_CASH..=PAY_TRANSFER).contains(&req.method) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "method must be 0 (cash), 1 (card) or 2 (transfer)".into(),
        ));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let bill: BillRow = sqlx::query_as::<_, BillRow>(&format!(
        r#"
        SELECT {BILL_COLUMNS}
        FROM bill
        WHERE bill_id = $1
        FOR UPDATE
        "#
    ))
    .bind(bill_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("bill"))?;

    if auth.role != ROLE_ADMIN && bill.clinic_id != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Bill belongs to another clinic".into(),
        ));
    }
    if bill.status != BILL_UNPAID {
        return Err(ApiError::Conflict(
            "BILL_NOT_PAYABLE",
            "Only unpaid bills can be paid".into(),
        ));
    }

    let amount = req.amount_cents.unwrap_or(bill.total_cents);
    if amount != bill.total_cents {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "amount_cents must match the bill total".into(),
        ));
    }

    sqlx::query(
        r#"
        INSERT INTO payment (bill_id, amount_cents, method, received_by)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(bill_id)
    .bind(amount)
    .bind(req.method)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let paid: BillRow = sqlx::query_as::<_, BillRow>(&format!(
        r#"
        UPDATE bill
        SET status = $2, paid_at = now()
        WHERE bill_id = $1
        RETURNING {BILL_COLUMNS}
        "#
    ))
    .bind(bill_id)
    .bind(BILL_PAID)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    // Loyalty rides the same transaction: a paid bill always lands in the
    // ledger, and the balance matches the ledger sum.
    let points = amount / SATANG_PER_POINT;
    ensure_member_tx(&mut tx, bill.patient_id).await?;

    sqlx::query(
        r#"
        INSERT INTO loyalty_transaction (patient_id, kind, points, note)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(bill.patient_id)
    .bind(LTX_EARN)
    .bind(points)
    .bind(format!("Bill {bill_id}"))
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let lifetime: i64 = sqlx::query_scalar(
        r#"
        UPDATE loyalty_member
        SET points_balance = points_balance + $2,
            lifetime_spend_cents = lifetime_spend_cents + $3
        WHERE patient_id = $1
        RETURNING lifetime_spend_cents
        "#,
    )
    .bind(bill.patient_id)
    .bind(points)
    .bind(amount)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE loyalty_member
        SET tier = $2
        WHERE patient_id = $1
        "#,
    )
    .bind(bill.patient_id)
    .bind(tier_for_lifetime_spend(lifetime))
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: paid }))
}

pub async fn void_bill(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(bill_id): Path<Uuid>,
) -> Result<Json<ApiOk<BillRow>>, ApiError> {
    if auth.role != ROLE_ADMIN && auth.role != ROLE_CLINIC {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/clinic can void bills".into(),
        ));
    }
    let bill = load_bill_scoped(&state, &auth, bill_id).await?;
    if bill.status != BILL_UNPAID {
        return Err(ApiError::Conflict(
            "BILL_NOT_VOIDABLE",
            "Only unpaid bills can be voided".into(),
        ));
    }

    let row: BillRow = sqlx::query_as::<_, BillRow>(&format!(
        r#"
        UPDATE bill
        SET status = $2
        WHERE bill_id = $1
          AND status = $3
        RETURNING {BILL_COLUMNS}
        "#
    ))
    .bind(bill_id)
    .bind(BILL_VOID)
    .bind(BILL_UNPAID)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::Conflict("BILL_NOT_VOIDABLE", "Bill changed state".into()))?;

    Ok(Json(ApiOk { data: row }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(desc: &str, qty: Option<i32>, unit: i64) -> CreateBillItem {
        CreateBillItem {
            description: desc.to_string(),
            quantity: qty,
            unit_price_cents: unit,
        }
    }

    #[test]
    fn total_sums_quantity_times_price() {
        let items = vec![item("PT session", Some(2), 150_000), item("Hot pack", None, 20_000)];
        assert_eq!(bill_total(&items).unwrap(), 320_000);
    }

    #[test]
    fn total_rejects_bad_items() {
        assert!(bill_total(&[]).is_err());
        assert!(bill_total(&[item("x", Some(0), 100)]).is_err());
        assert!(bill_total(&[item("x", None, -5)]).is_err());
        assert!(bill_total(&[item("  ", None, 100)]).is_err());
    }

    #[test]
    fn points_per_hundred_baht() {
        assert_eq!(150_000 / SATANG_PER_POINT, 15);
        assert_eq!(9_999 / SATANG_PER_POINT, 0);
    }
}
