use axum::{
    Router,
    routing::{get, post},
};

pub mod admin;
pub mod audio;
pub mod briefs;
pub mod notifications;
pub mod system;

/// Router for all user-scoped endpoints (require `X-User-Id`).
pub fn router() -> Router {
    Router::new()
        .nest("/briefs", briefs::router())
        .route("/notifications/stream", get(notifications::stream))
}

/// Operator endpoints (require `X-Admin-Token`).
pub fn admin_router() -> Router {
    Router::new()
        .route("/admin/briefs/fan-out", post(admin::fan_out))
        .route("/admin/dispatcher", get(admin::dispatcher_stats))
}
