use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use chrono::{Duration, Utc};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{generate_access_token, generate_temp_password, hash_access_token, hash_password, verify_password},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{role_to_string, *},
    totp,
};

// Safety cap for remember-me and admin session extension.
const REMEMBER_ME_TTL_HOURS: i64 = 24 * 7;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/logout", post(logout))
        // Rotate the access token for the current session (old token dies immediately)
        .route("/refresh", post(refresh))
        .route("/sessions", get(list_sessions))
        .route("/sessions/revoke_all", post(revoke_all_sessions))
        .route("/sessions/{session_token_id}/revoke", post(revoke_session))
        // Password management
        .route("/change_password", post(change_password))
        .route("/reset_password", post(reset_password))
        // Two-factor
        .route("/totp/setup", post(totp_setup))
        .route("/totp/enable", post(totp_enable))
        .route("/totp/disable", post(totp_disable))
        // Google sign-in / account linking
        .route("/google/exchange", post(google_exchange))
        .route("/google/link", post(google_link))
        .route("/google/unlink", post(google_unlink))
}

/* ============================================================
   Shared helpers
   ============================================================ */

async fn load_clinic_profile(state: &AppState, clinic_id: Uuid) -> Result<ClinicProfile, ApiError> {
    let clinic: ClinicRow = sqlx::query_as::<_, ClinicRow>(
        r#"
        SELECT clinic_id, code, name
        FROM clinic
        WHERE clinic_id = $1
        "#,
    )
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    Ok(ClinicProfile {
        clinic_id: clinic.clinic_id,
        code: clinic.code,
        name: clinic.name,
    })
}

fn profile_of(user: &UserRow) -> UserProfile {
    UserProfile {
        user_id: user.user_id,
        email: user.email.clone(),
        display_name: user.display_name.clone(),
        role: role_to_string(user.role),
        clinic_id: user.clinic_id,
        totp_enabled: user.totp_enabled,
        google_linked: user.google_sub.is_some(),
    }
}

async fn load_user_by_id(state: &AppState, user_id: Uuid) -> Result<UserRow, ApiError> {
    sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, clinic_id, email, display_name, password_hash, role,
               is_active, totp_secret, totp_enabled, google_sub
        FROM app_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)
}

async fn create_session(
    state: &AppState,
    user_id: Uuid,
    device_name: Option<&str>,
    ttl_hours: i64,
) -> Result<(String, SessionTokenRow), ApiError> {
    let access_token = generate_access_token();
    let token_hash = hash_access_token(&access_token);
    let expires_at = Utc::now() + Duration::hours(ttl_hours);

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        INSERT INTO session_token (user_id, session_token_hash, device_name, expires_at)
        VALUES ($1, $2, $3, $4)
        RETURNING session_token_id, expires_at
        "#,
    )
    .bind(user_id)
    .bind(&token_hash)
    .bind(device_name)
    .bind(expires_at)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok((access_token, session))
}

fn decode_totp_secret(encoded: &str) -> Result<Vec<u8>, ApiError> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ApiError::Internal("stored TOTP secret is corrupt".into()))
}

/* ============================================================
   POST /login
   ============================================================ */

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "email and password are required".into(),
        ));
    }

    if let Err(seconds) = state.login_limiter.check(&email) {
        return Err(ApiError::TooManyRequests(
            "LOGIN_LOCKED",
            format!("Too many failed attempts; locked for another {seconds} seconds"),
        ));
    }

    let user: Option<UserRow> = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, clinic_id, email, display_name, password_hash, role,
               is_active, totp_secret, totp_enabled, google_sub
        FROM app_user
        WHERE email = $1
        "#,
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(user) = user else {
        state.login_limiter.record_failure(&email);
        return Err(ApiError::invalid_credentials());
    };

    if !user.is_active {
        return Err(ApiError::Forbidden("FORBIDDEN", "Account is disabled".into()));
    }

    if !verify_password(&req.password, &user.password_hash) {
        if state.login_limiter.record_failure(&email) {
            tracing::warn!("login lockout triggered for {email}");
        }
        return Err(ApiError::invalid_credentials());
    }

    if user.totp_enabled {
        let Some(code) = req.totp_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
            return Err(ApiError::Unauthorized(
                "TOTP_REQUIRED",
                "This account requires a one-time code".into(),
            ));
        };
        let secret = decode_totp_secret(user.totp_secret.as_deref().unwrap_or_default())?;
        if !totp::verify_code(&secret, code, Utc::now().timestamp() as u64) {
            if state.login_limiter.record_failure(&email) {
                tracing::warn!("login lockout triggered for {email}");
            }
            return Err(ApiError::Unauthorized(
                "INVALID_TOTP",
                "One-time code is incorrect".into(),
            ));
        }
    }

    state.login_limiter.record_success(&email);

    let ttl_hours = if req.remember_me.unwrap_or(false) {
        REMEMBER_ME_TTL_HOURS
    } else {
        state.session_ttl_hours
    };

    let (access_token, session) =
        create_session(&state, user.user_id, req.device_name.as_deref(), ttl_hours).await?;
    let clinic = load_clinic_profile(&state, user.clinic_id).await?;

    Ok(Json(LoginResponse {
        data: LoginResponseData {
            access_token,
            expires_at: session.expires_at,
            user: profile_of(&user),
            clinic,
        },
    }))
}

/* ============================================================
   GET /me, POST /logout, POST /refresh
   ============================================================ */

pub async fn me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<MeResponse>, ApiError> {
    let user = load_user_by_id(&state, auth.user_id).await?;
    if !user.is_active {
        return Err(ApiError::session_expired());
    }
    let clinic = load_clinic_profile(&state, user.clinic_id).await?;

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        SELECT session_token_id, expires_at
        FROM session_token
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
          AND expires_at > now()
        "#,
    )
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)?;

    Ok(Json(MeResponse {
        data: MeResponseData {
            user: profile_of(&user),
            clinic,
            session: SessionInfo {
                session_token_id: session.session_token_id,
                expires_at: session.expires_at,
            },
        },
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<OkResponse>, ApiError> {
    let rows = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if rows.rows_affected() == 0 {
        return Err(ApiError::session_expired());
    }

    Ok(Json(OkResponse::yes()))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub data: RefreshData,
}

#[derive(Debug, Serialize)]
pub struct RefreshData {
    pub access_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub session_token_id: Uuid,
}

pub async fn refresh(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RefreshResponse>, ApiError> {
    let new_token = generate_access_token();
    let new_hash = hash_access_token(&new_token);

    let row: Option<(chrono::DateTime<chrono::Utc>,)> = sqlx::query_as(
        r#"
        UPDATE session_token
        SET session_token_hash = $1,
            last_seen_at = now()
        WHERE session_token_id = $2
          AND user_id = $3
          AND revoked_at IS NULL
          AND expires_at > now()
        RETURNING expires_at
        "#,
    )
    .bind(new_hash)
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let expires_at = row.ok_or_else(ApiError::session_expired)?.0;

    Ok(Json(RefreshResponse {
        data: RefreshData {
            access_token: new_token,
            expires_at,
            session_token_id: auth.session_token_id,
        },
    }))
}

/* ============================================================
   Session management
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SessionListItem {
    pub session_token_id: Uuid,
    pub device_name: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsData {
    pub sessions: Vec<SessionListItem>,
    pub current_session_token_id: Uuid,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<ListSessionsData>>, ApiError> {
    let rows: Vec<SessionListItem> = sqlx::query_as::<_, SessionListItem>(
        r#"
        SELECT session_token_id, device_name, expires_at, last_seen_at, created_at
        FROM session_token
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
        ORDER BY last_seen_at DESC NULLS LAST, created_at DESC
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: ListSessionsData {
            sessions: rows,
            current_session_token_id: auth.session_token_id,
        },
    }))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(session_token_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    let res = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(session_token_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("session"));
    }

    Ok(Json(OkResponse::yes()))
}

#[derive(Debug, Serialize)]
pub struct RevokeAllData {
    pub revoked_count: i64,
}

pub async fn revoke_all_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<RevokeAllData>>, ApiError> {
    // Everything except the session making the request.
    let res = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
          AND session_token_id <> $2
        "#,
    )
    .bind(auth.user_id)
    .bind(auth.session_token_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: RevokeAllData {
            revoked_count: res.rows_affected() as i64,
        },
    }))
}

/* ============================================================
   Password management
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

fn validate_new_password(pw: &str) -> Result<(), ApiError> {
    if pw.trim().len() < 8 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "new_password must be at least 8 characters".into(),
        ));
    }
    Ok(())
}

pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.old_password.is_empty() || req.new_password.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "old_password and new_password are required".into(),
        ));
    }
    validate_new_password(&req.new_password)?;

    let row: (String,) = sqlx::query_as(
        r#"
        SELECT password_hash
        FROM app_user
        WHERE user_id = $1
          AND is_active = true
        "#,
    )
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(ApiError::session_expired)?;

    if !verify_password(&req.old_password, &row.0) {
        return Err(ApiError::invalid_credentials());
    }

    let new_hash = hash_password(&req.new_password).map_err(ApiError::Internal)?;

    // Update + revoke other sessions atomically
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE app_user
        SET password_hash = $1
        WHERE user_id = $2
        "#,
    )
    .bind(new_hash)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
          AND session_token_id <> $2
        "#,
    )
    .bind(auth.user_id)
    .bind(auth.session_token_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(OkResponse::yes()))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    /// Omitted => a temporary password is generated and returned once.
    pub new_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordData {
    pub user_id: Uuid,
    pub email: String,
    pub temporary_password: Option<String>,
}

fn ensure_admin_or_clinic(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == ROLE_ADMIN || auth.role == ROLE_CLINIC {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/clinic can reset passwords".into(),
        ))
    }
}

pub async fn reset_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<ApiOk<ResetPasswordData>>, ApiError> {
    ensure_admin_or_clinic(&auth)?;

    let email = req.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::BadRequest("VALIDATION_ERROR", "email is required".into()));
    }

    let (new_pw, return_pw) = match req.new_password.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(pw) => {
            validate_new_password(pw)?;
            (pw.to_string(), None)
        }
        None => {
            let temp = generate_temp_password();
            (temp.clone(), Some(temp))
        }
    };

    let new_hash = hash_password(&new_pw).map_err(ApiError::Internal)?;

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Clinic managers only reach accounts of their own clinic.
    let target: Option<(Uuid, String, Uuid)> = sqlx::query_as(
        r#"
        SELECT user_id, email, clinic_id
        FROM app_user
        WHERE email = $1
        "#,
    )
    .bind(&email)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let Some((target_id, target_email, target_clinic)) = target else {
        return Err(ApiError::not_found("user"));
    };
    if auth.role == ROLE_CLINIC && target_clinic != auth.clinic_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Cannot reset passwords outside your clinic".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE app_user
        SET password_hash = $1
        WHERE user_id = $2
        "#,
    )
    .bind(new_hash)
    .bind(target_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(target_id)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: ResetPasswordData {
            user_id: target_id,
            email: target_email,
            temporary_password: return_pw,
        },
    }))
}

/* ============================================================
   TOTP two-factor
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct TotpSetupData {
    pub secret: String,
    pub otpauth_uri: String,
}

/// Generates and stores a pending secret; 2FA stays off until /totp/enable
/// proves the authenticator was enrolled.
pub async fn totp_setup(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<TotpSetupData>>, ApiError> {
    let user = load_user_by_id(&state, auth.user_id).await?;
    if user.totp_enabled {
        return Err(ApiError::Conflict(
            "TOTP_ALREADY_ENABLED",
            "Disable the current authenticator first".into(),
        ));
    }

    let secret = totp::generate_secret();
    let encoded = URL_SAFE_NO_PAD.encode(&secret);

    sqlx::query(
        r#"
        UPDATE app_user
        SET totp_secret = $1, totp_enabled = false
        WHERE user_id = $2
        "#,
    )
    .bind(&encoded)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: TotpSetupData {
            otpauth_uri: totp::otpauth_uri(&secret, &user.email, "PTMS"),
            secret: encoded,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct TotpCodeRequest {
    pub code: String,
}

pub async fn totp_enable(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<TotpCodeRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let user = load_user_by_id(&state, auth.user_id).await?;
    let Some(encoded) = user.totp_secret.as_deref() else {
        return Err(ApiError::BadRequest(
            "TOTP_NOT_SET_UP",
            "Call /totp/setup first".into(),
        ));
    };
    let secret = decode_totp_secret(encoded)?;
    if !totp::verify_code(&secret, req.code.trim(), Utc::now().timestamp() as u64) {
        return Err(ApiError::Unauthorized(
            "INVALID_TOTP",
            "One-time code is incorrect".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE app_user
        SET totp_enabled = true
        WHERE user_id = $1
        "#,
    )
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(OkResponse::yes()))
}

pub async fn totp_disable(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<TotpCodeRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let user = load_user_by_id(&state, auth.user_id).await?;
    if !user.totp_enabled {
        return Ok(Json(OkResponse::yes()));
    }
    let secret = decode_totp_secret(user.totp_secret.as_deref().unwrap_or_default())?;
    if !totp::verify_code(&secret, req.code.trim(), Utc::now().timestamp() as u64) {
        return Err(ApiError::Unauthorized(
            "INVALID_TOTP",
            "One-time code is incorrect".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE app_user
        SET totp_secret = NULL, totp_enabled = false
        WHERE user_id = $1
        "#,
    )
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(OkResponse::yes()))
}

/* ============================================================
   Google OAuth2
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct GoogleExchangeRequest {
    pub code: String,
    pub device_name: Option<String>,
}

struct GoogleUser {
    sub: String,
    email: String,
}

async fn google_userinfo(state: &AppState, code: &str) -> Result<GoogleUser, ApiError> {
    let Some(oauth) = state.google_oauth.as_ref() else {
        return Err(ApiError::BadRequest(
            "GOOGLE_NOT_CONFIGURED",
            "Google sign-in is not configured".into(),
        ));
    };

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }
    #[derive(Deserialize)]
    struct UserInfo {
        id: String,
        email: String,
    }

    let http = reqwest::Client::new();
    let token_res = http
        .post("https://oauth2.googleapis.com/token")
        .form(&[
            ("code", code),
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("redirect_uri", oauth.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .map_err(|e| ApiError::Internal(format!("google token exchange: {e}")))?;

    if !token_res.status().is_success() {
        return Err(ApiError::Unauthorized(
            "GOOGLE_CODE_REJECTED",
            "Google did not accept the authorization code".into(),
        ));
    }
    let token: TokenResponse = token_res
        .json()
        .await
        .map_err(|e| ApiError::Internal(format!("google token decode: {e}")))?;

    let info: UserInfo = http
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .bearer_auth(&token.access_token)
        .send()
        .await
        .map_err(|e| ApiError::Internal(format!("google userinfo: {e}")))?
        .json()
        .await
        .map_err(|e| ApiError::Internal(format!("google userinfo decode: {e}")))?;

    Ok(GoogleUser {
        sub: info.id,
        email: info.email,
    })
}

/// Sign in with a Google authorization code. Only works for accounts that
/// previously linked their Google identity.
pub async fn google_exchange(
    State(state): State<AppState>,
    Json(req): Json<GoogleExchangeRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let ginfo = google_userinfo(&state, req.code.trim()).await?;

    let user: UserRow = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, clinic_id, email, display_name, password_hash, role,
               is_active, totp_secret, totp_enabled, google_sub
        FROM app_user
        WHERE google_sub = $1
        "#,
    )
    .bind(&ginfo.sub)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| {
        ApiError::Unauthorized(
            "GOOGLE_NOT_LINKED",
            "No account is linked to this Google identity".into(),
        )
    })?;

    if !user.is_active {
        return Err(ApiError::Forbidden("FORBIDDEN", "Account is disabled".into()));
    }

    let (access_token, session) = create_session(
        &state,
        user.user_id,
        req.device_name.as_deref(),
        state.session_ttl_hours,
    )
    .await?;
    let clinic = load_clinic_profile(&state, user.clinic_id).await?;

    Ok(Json(LoginResponse {
        data: LoginResponseData {
            access_token,
            expires_at: session.expires_at,
            user: profile_of(&user),
            clinic,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct GoogleLinkRequest {
    pub code: String,
}

pub async fn google_link(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<GoogleLinkRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let ginfo = google_userinfo(&state, req.code.trim()).await?;

    let taken: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT user_id
        FROM app_user
        WHERE google_sub = $1
          AND user_id <> $2
        "#,
    )
    .bind(&ginfo.sub)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    if taken.is_some() {
        return Err(ApiError::Conflict(
            "GOOGLE_ALREADY_LINKED",
            "This Google identity is linked to another account".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE app_user
        SET google_sub = $1, google_email = $2
        WHERE user_id = $3
        "#,
    )
    .bind(&ginfo.sub)
    .bind(&ginfo.email)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(OkResponse::yes()))
}

pub async fn google_unlink(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<OkResponse>, ApiError> {
    sqlx::query(
        r#"
        UPDATE app_user
        SET google_sub = NULL, google_email = NULL
        WHERE user_id = $1
        "#,
    )
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(OkResponse::yes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_password_minimum_length() {
        assert!(validate_new_password("12345678").is_ok());
        assert!(validate_new_password("1234567").is_err());
        assert!(validate_new_password("  short  ").is_err());
    }
}
