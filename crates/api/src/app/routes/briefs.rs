use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use civicbrief_core::BriefType;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_brief))
        .route("/jobs/:job_id", get(get_job).delete(cancel_job))
        .route("/history", get(list_history))
        .route("/queue", get(get_queue))
        .route("/stats", get(get_stats))
        .route(
            "/subscription",
            axum::routing::put(subscribe).delete(unsubscribe),
        )
}

pub async fn submit_brief(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::SubmitBriefRequest>,
) -> axum::response::Response {
    let request = match body.into_job_request() {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match services.service.submit(user.user_id(), request).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let job = match services.store.get_status(user.user_id(), job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
        }
        Err(e) => return errors::store_error_to_response(e),
    };
    let position = match services.store.queue_position(user.user_id(), job_id).await {
        Ok(p) => p,
        Err(e) => return errors::store_error_to_response(e),
    };

    Json(dto::JobView::from_record(job, position)).into_response()
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store.cancel(user.user_id(), job_id).await {
        Ok(cancelled) => Json(json!({ "cancelled": cancelled })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_history(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.store.list_history(user.user_id()).await {
        Ok(jobs) => Json(
            jobs.into_iter()
                .map(|j| dto::JobView::from_record(j, None))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.store.get_queue(user.user_id()).await {
        Ok(jobs) => Json(
            jobs.into_iter()
                .enumerate()
                .map(|(i, j)| dto::JobView::from_record(j, Some(i + 1)))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.store.stats(user.user_id()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// PUT /briefs/subscription
///
/// Opts the caller into scheduled fan-out for the given brief types.
pub async fn subscribe(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::SubscriptionRequest>,
) -> axum::response::Response {
    let types = match body
        .types
        .iter()
        .map(|t| dto::parse_brief_type(t))
        .collect::<Result<Vec<BriefType>, _>>()
    {
        Ok(types) => types,
        Err(resp) => return resp,
    };

    services
        .subscribers
        .subscribe(user.user_id(), types.clone(), body.payload);
    Json(json!({ "subscribed": types })).into_response()
}

pub async fn unsubscribe(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    let removed = services.subscribers.unsubscribe(user.user_id());
    Json(json!({ "unsubscribed": removed })).into_response()
}
