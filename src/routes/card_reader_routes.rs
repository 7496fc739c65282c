use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;

use crate::{
    card_cache::ThaiCardData,
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::*,
    thai_id,
};

pub fn router() -> Router<AppState> {
    Router::new()
        // The local reader agent posts here; it runs next to the browser on
        // the front-desk machine and holds no session.
        .route("/thai_card", post(put_card).get(poll_card))
}

pub async fn put_card(
    State(state): State<AppState>,
    Json(card): Json<ThaiCardData>,
) -> Result<Json<OkResponse>, ApiError> {
    if !thai_id::is_valid_citizen_id(card.citizen_id.trim()) {
        return Err(ApiError::BadRequest(
            "INVALID_CITIZEN_ID",
            "card payload failed the checksum".into(),
        ));
    }
    if card.first_name.trim().is_empty() || card.last_name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "card payload is missing the name".into(),
        ));
    }

    state.card_cache.put(card);
    Ok(Json(OkResponse::yes()))
}

#[derive(Debug, Serialize)]
pub struct PollCardData {
    pub card: Option<ThaiCardData>,
}

/// The registration page polls this; a hit consumes the slot so the same
/// card never prefills two registrations.
pub async fn poll_card(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<PollCardData>>, ApiError> {
    if auth.role == ROLE_USER {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only staff can read the card slot".into(),
        ));
    }

    Ok(Json(ApiOk {
        data: PollCardData {
            card: state.card_cache.take(),
        },
    }))
}
