use std::sync::Arc;

use axum::{extract::Extension, response::sse::Event as SseEvent};

use crate::app::services::{self, AppServices};
use crate::context::UserContext;

/// GET /notifications/stream
///
/// Server-Sent Events for the caller's `ready` / `failed` notifications.
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>>
{
    services::user_notification_stream(services, user.user_id())
}
