use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::ApiError;

const MAX_SEQ: i32 = 9999;

/// `PT<YY><NNNN>` — two-digit year, four-digit zero-padded sequence.
pub fn format_pthn(year: i32, seq: i32) -> String {
    format!("PT{:02}{:04}", year.rem_euclid(100), seq)
}

/// Issue the next PTHN for (clinic, year) inside the caller's transaction.
///
/// The counter row is taken with SELECT ... FOR UPDATE so two concurrent
/// registrations serialize on it; the caller's rollback releases the lock
/// without burning a sequence number. Once the four-digit sequence is
/// exhausted for the year the registration is refused.
pub async fn next_pthn(
    tx: &mut Transaction<'_, Postgres>,
    clinic_id: Uuid,
    year: i32,
) -> Result<String, ApiError> {
    sqlx::query(
        r#"
        INSERT INTO pthn_sequence (clinic_id, year, last_seq)
        VALUES ($1, $2, 0)
        ON CONFLICT (clinic_id, year) DO NOTHING
        "#,
    )
    .bind(clinic_id)
    .bind(year)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?;

    let last_seq: i32 = sqlx::query_scalar(
        r#"
        SELECT last_seq
        FROM pthn_sequence
        WHERE clinic_id = $1 AND year = $2
        FOR UPDATE
        "#,
    )
    .bind(clinic_id)
    .bind(year)
    .fetch_one(&mut **tx)
    .await
    .map_err(ApiError::db)?;

    if last_seq >= MAX_SEQ {
        return Err(ApiError::Conflict(
            "PTHN_EXHAUSTED",
            format!("PTHN sequence for year {year} is exhausted"),
        ));
    }

    let seq = last_seq + 1;
    sqlx::query(
        r#"
        UPDATE pthn_sequence
        SET last_seq = $3
        WHERE clinic_id = $1 AND year = $2
        "#,
    )
    .bind(clinic_id)
    .bind(year)
    .bind(seq)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::db)?;

    Ok(format_pthn(year, seq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pthn_is_zero_padded() {
        assert_eq!(format_pthn(2026, 1), "PT260001");
        assert_eq!(format_pthn(2026, 42), "PT260042");
        assert_eq!(format_pthn(2030, 9999), "PT309999");
    }

    #[test]
    fn year_wraps_to_two_digits() {
        assert_eq!(format_pthn(2099, 7), "PT990007");
        assert_eq!(format_pthn(2100, 7), "PT000007");
    }
}
