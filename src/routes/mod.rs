use crate::middleware::audit::audit_layer;
use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod auth_routes;
pub mod billing_routes;
pub mod card_reader_routes;
pub mod chat_routes;
pub mod clinic_routes;
pub mod course_routes;
pub mod expense_routes;
pub mod home_routes;
pub mod loyalty_routes;
pub mod patient_routes;
pub mod pn_routes;
pub mod user_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/users", user_routes::router())
        .nest("/api/v1", clinic_routes::router())
        .nest("/api/v1", patient_routes::router())
        .nest("/api/v1", pn_routes::router())
        .nest("/api/v1", appointment_routes::router())
        .nest("/api/v1", course_routes::router())
        .nest("/api/v1", billing_routes::router())
        .nest("/api/v1", expense_routes::router())
        .nest("/api/v1", loyalty_routes::router())
        .nest("/api/v1", chat_routes::router())
        .nest("/api/v1", card_reader_routes::router())
        .nest("/api/v1", home_routes::router())
        .layer(axum::middleware::from_fn_with_state(state.clone(), audit_layer))
        .with_state(state)
}
