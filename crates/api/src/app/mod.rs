//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (job store, queue, dispatcher, notifiers)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use civicbrief_infra::BriefsConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppOptions, AppServices, ServicesError};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: BriefsConfig, options: AppOptions) -> Result<Router, ServicesError> {
    let services = Arc::new(services::build_services(config, &options).await?);
    Ok(router(services))
}

/// Router over already-wired services.
pub fn router(services: Arc<AppServices>) -> Router {
    // User-scoped routes: require caller identity.
    let protected = routes::router()
        .layer(axum::middleware::from_fn(middleware::user_context_middleware));

    // Operator routes: shared admin token, refused when none is configured.
    let admin = routes::admin_router()
        .layer(axum::middleware::from_fn(middleware::admin_token_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/audio/:user_id/:file", get(routes::audio::get_audio))
        .merge(protected)
        .merge(admin)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
