use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::card_cache::CardCache;
use crate::chat::ChatRegistry;
use crate::config::GoogleOAuthConfig;
use crate::notify::Notifier;
use crate::rate_limit::LoginRateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub session_ttl_hours: i64,
    /// Clinic code that routes initial-assessment completions through the
    /// body-annotation flow.
    pub initial_assessment_clinic: String,
    pub google_oauth: Option<GoogleOAuthConfig>,
    pub login_limiter: Arc<LoginRateLimiter>,
    pub card_cache: Arc<CardCache>,
    pub chat: Arc<ChatRegistry>,
    pub notifier: Arc<Notifier>,
}

/* -------------------------
   Generic envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

impl OkResponse {
    pub fn yes() -> Self {
        OkResponse {
            data: OkData { ok: true },
        }
    }
}

/* -------------------------
   Auth DTOs
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Required when the account has TOTP enabled.
    pub totp_code: Option<String>,
    pub device_name: Option<String>,
    pub remember_me: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub data: LoginResponseData,
}

#[derive(Debug, Serialize)]
pub struct LoginResponseData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
    pub clinic: ClinicProfile,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub data: MeResponseData,
}

#[derive(Debug, Serialize)]
pub struct MeResponseData {
    pub user: UserProfile,
    pub clinic: ClinicProfile,
    pub session: SessionInfo,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub clinic_id: Uuid,
    pub totp_enabled: bool,
    pub google_linked: bool,
}

#[derive(Debug, Serialize)]
pub struct ClinicProfile {
    pub clinic_id: Uuid,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub clinic_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: i16,
    pub is_active: bool,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub google_sub: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SessionTokenRow {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct ClinicRow {
    pub clinic_id: Uuid,
    pub code: String,
    pub name: String,
}

/* -------------------------
   Roles
--------------------------*/

// app_user.role
pub const ROLE_USER: i16 = 0;
pub const ROLE_ADMIN: i16 = 1;
pub const ROLE_CLINIC: i16 = 2;
pub const ROLE_PT: i16 = 3;

pub fn role_to_string(role: i16) -> String {
    match role {
        ROLE_USER => "user",
        ROLE_ADMIN => "admin",
        ROLE_CLINIC => "clinic",
        ROLE_PT => "pt",
        _ => "unknown",
    }
    .to_string()
}

pub fn is_known_role(role: i16) -> bool {
    (ROLE_USER..=ROLE_PT).contains(&role)
}

/* -------------------------
   Case / appointment status
--------------------------*/

// Shared by pn_case.status and appointment.status.
pub const STATUS_PENDING: i16 = 0;
pub const STATUS_ACCEPTED: i16 = 1;
pub const STATUS_COMPLETED: i16 = 2;
pub const STATUS_CANCELLED: i16 = 3;

pub fn status_to_string(status: i16) -> String {
    match status {
        STATUS_PENDING => "PENDING",
        STATUS_ACCEPTED => "ACCEPTED",
        STATUS_COMPLETED => "COMPLETED",
        STATUS_CANCELLED => "CANCELLED",
        _ => "UNKNOWN",
    }
    .to_string()
}

/// The one transition table. Every status-changing endpoint goes through
/// this; there is no other path to COMPLETED or CANCELLED.
pub fn can_transition(from: i16, to: i16) -> bool {
    matches!(
        (from, to),
        (STATUS_PENDING, STATUS_ACCEPTED)
            | (STATUS_PENDING, STATUS_CANCELLED)
            | (STATUS_ACCEPTED, STATUS_COMPLETED)
            | (STATUS_ACCEPTED, STATUS_CANCELLED)
    )
}

/* -------------------------
   Appointment enums
--------------------------*/

// appointment.booking_type
pub const BOOKING_OLD_PATIENT: i16 = 0;
pub const BOOKING_WALK_IN: i16 = 1;

// appointment.appointment_type
pub const APPT_GENERAL: i16 = 0;
pub const APPT_INITIAL_ASSESSMENT: i16 = 1;
pub const APPT_BODY_CHECK: i16 = 2;

/* -------------------------
   Loyalty tiers
--------------------------*/

// loyalty_member.tier
pub const TIER_BRONZE: i16 = 0;
pub const TIER_SILVER: i16 = 1;
pub const TIER_GOLD: i16 = 2;
pub const TIER_PLATINUM: i16 = 3;

// Lifetime spend thresholds in satang (1 THB = 100 satang).
const SILVER_AT: i64 = 5_000_000;
const GOLD_AT: i64 = 15_000_000;
const PLATINUM_AT: i64 = 40_000_000;

pub fn tier_to_string(tier: i16) -> String {
    match tier {
        TIER_BRONZE => "BRONZE",
        TIER_SILVER => "SILVER",
        TIER_GOLD => "GOLD",
        TIER_PLATINUM => "PLATINUM",
        _ => "UNKNOWN",
    }
    .to_string()
}

pub fn tier_for_lifetime_spend(satang: i64) -> i16 {
    if satang >= PLATINUM_AT {
        TIER_PLATINUM
    } else if satang >= GOLD_AT {
        TIER_GOLD
    } else if satang >= SILVER_AT {
        TIER_SILVER
    } else {
        TIER_BRONZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_allows_the_documented_paths() {
        assert!(can_transition(STATUS_PENDING, STATUS_ACCEPTED));
        assert!(can_transition(STATUS_PENDING, STATUS_CANCELLED));
        assert!(can_transition(STATUS_ACCEPTED, STATUS_COMPLETED));
        assert!(can_transition(STATUS_ACCEPTED, STATUS_CANCELLED));
    }

    #[test]
    fn transition_table_rejects_everything_else() {
        // Terminal states never move again.
        for to in 0..=3 {
            assert!(!can_transition(STATUS_COMPLETED, to));
            assert!(!can_transition(STATUS_CANCELLED, to));
        }
        // No skipping straight to COMPLETED.
        assert!(!can_transition(STATUS_PENDING, STATUS_COMPLETED));
        // No self-loops.
        for s in 0..=3 {
            assert!(!can_transition(s, s));
        }
    }

    #[test]
    fn tier_thresholds() {
        assert_eq!(tier_for_lifetime_spend(0), TIER_BRONZE);
        assert_eq!(tier_for_lifetime_spend(SILVER_AT - 1), TIER_BRONZE);
        assert_eq!(tier_for_lifetime_spend(SILVER_AT), TIER_SILVER);
        assert_eq!(tier_for_lifetime_spend(GOLD_AT), TIER_GOLD);
        assert_eq!(tier_for_lifetime_spend(PLATINUM_AT + 1), TIER_PLATINUM);
    }
}
