use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/expenses", get(list_expenses).post(create_expense))
        .route("/expenses/summary", get(monthly_summary))
        .route("/expenses/{expense_id}", get(get_expense).delete(delete_expense))
}

fn ensure_admin_or_clinic(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/clinic can manage expenses".into(),
        ))
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ExpenseRow {
    pub expense_id: Uuid,
    pub clinic_id: Uuid,
    pub category: String,
    pub amount_cents: i64,
    pub note: Option<String>,
    pub spent_on: NaiveDate,
    pub recorded_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateExpenseRequest {
    pub category: String,
    pub amount_cents: i64,
    pub note: Option<String>,
    pub spent_on: Option<NaiveDate>,
}

pub async fn create_expense(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateExpenseRequest>,
) -> Result<Json<ApiOk<ExpenseRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let category = req.category.trim();
    if category.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "category is required".into(),
        ));
    }
    if req.amount_cents <= 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "amount_cents must be positive".into(),
        ));
    }
    let spent_on = req.spent_on.unwrap_or_else(|| Utc::now().date_naive());

    let row: ExpenseRow = sqlx::query_as::<_, ExpenseRow>(
        r#"
        INSERT INTO expense (clinic_id, category, amount_cents, note, spent_on, recorded_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING expense_id, clinic_id, category, amount_cents, note, spent_on,
                  recorded_by, created_at
        "#,
    )
    .bind(auth.clinic_id)
    .bind(category)
    .bind(req.amount_cents)
    .bind(req.note.as_deref())
    .bind(spent_on)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct ListExpensesQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub category: Option<String>,
}

pub async fn list_expenses(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<ListExpensesQuery>,
) -> Result<Json<ApiOk<Vec<ExpenseRow>>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let rows: Vec<ExpenseRow> = sqlx::query_as::<_, ExpenseRow>(
        r#"
        SELECT expense_id, clinic_id, category, amount_cents, note, spent_on,
               recorded_by, created_at
        FROM expense
        WHERE clinic_id = $1
          AND ($2::date IS NULL OR spent_on >= $2)
          AND ($3::date IS NULL OR spent_on <= $3)
          AND ($4::text IS NULL OR category = $4)
        ORDER BY spent_on DESC, created_at DESC
        LIMIT 200
        "#,
    )
    .bind(auth.clinic_id)
    .bind(q.from)
    .bind(q.to)
    .bind(q.category.as_deref().map(str::trim))
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn get_expense(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(expense_id): Path<Uuid>,
) -> Result<Json<ApiOk<ExpenseRow>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let row: ExpenseRow = sqlx::query_as::<_, ExpenseRow>(
        r#"
        SELECT expense_id, clinic_id, category, amount_cents, note, spent_on,
               recorded_by, created_at
        FROM expense
        WHERE expense_id = $1
          AND clinic_id = $2
        "#,
    )
    .bind(expense_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("expense"))?;

    Ok(Json(ApiOk { data: row }))
}

pub async fn delete_expense(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(expense_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let res = sqlx::query(
        r#"
        DELETE FROM expense
        WHERE expense_id = $1
          AND clinic_id = $2
        "#,
    )
    .bind(expense_id)
    .bind(auth.clinic_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("expense"));
    }

    Ok(Json(OkResponse::yes()))
}

/* ============================================================
   Monthly rollup
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    /// YYYY-MM
    pub month: String,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CategoryTotalRow {
    pub category: String,
    pub total_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct SummaryData {
    pub month: String,
    pub categories: Vec<CategoryTotalRow>,
    pub total_cents: i64,
}

fn parse_month(month: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest("VALIDATION_ERROR", "month must be YYYY-MM".into())
    })
}

pub async fn monthly_summary(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SummaryQuery>,
) -> Result<Json<ApiOk<SummaryData>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let first = parse_month(q.month.trim())?;
    let next = first
        .checked_add_months(chrono::Months::new(1))
        .expect("month arithmetic stays in range");

    let categories: Vec<CategoryTotalRow> = sqlx::query_as::<_, CategoryTotalRow>(
        r#"
        SELECT category, SUM(amount_cents)::bigint AS total_cents
        FROM expense
        WHERE clinic_id = $1
          AND spent_on >= $2
          AND spent_on < $3
        GROUP BY category
        ORDER BY total_cents DESC
        "#,
    )
    .bind(auth.clinic_id)
    .bind(first)
    .bind(next)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let total_cents = categories.iter().map(|c| c.total_cents).sum();

    Ok(Json(ApiOk {
        data: SummaryData {
            month: q.month.trim().to_string(),
            categories,
            total_cents,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_parsing() {
        assert_eq!(
            parse_month("2026-02").unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
        );
        assert!(parse_month("2026-13").is_err());
        assert!(parse_month("Feb 2026").is_err());
    }
}
