use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// POST /admin/briefs/fan-out?type=daily|weekly
///
/// Submits one job per subscribed user. Per-user failures are counted, not fatal.
pub async fn fan_out(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::FanOutQuery>,
) -> axum::response::Response {
    let brief_type = match dto::parse_brief_type(&query.brief_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match services.scheduler.fan_out(brief_type).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::json_error(StatusCode::BAD_GATEWAY, "directory_error", e.to_string()),
    }
}

/// GET /admin/dispatcher
pub async fn dispatcher_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.dispatcher_stats() {
        Some(stats) => Json(stats).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "dispatcher_disabled",
            "no dispatcher is running in this process",
        ),
    }
}
