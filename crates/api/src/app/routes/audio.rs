//! Serves files written by the local object storage.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::IntoResponse,
};

use civicbrief_core::UserId;

use crate::app::errors;
use crate::app::services::AppServices;

/// GET /audio/:user_id/:file
pub async fn get_audio(
    Extension(services): Extension<Arc<AppServices>>,
    Path((user_id, file)): Path<(String, String)>,
) -> axum::response::Response {
    let Ok(user_id) = user_id.parse::<UserId>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "audio not found");
    };
    if !is_plain_file_name(&file) {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_path", "invalid file name");
    }

    let path = services
        .config
        .audio_dir
        .join(user_id.to_string())
        .join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&file))], bytes).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            errors::json_error(StatusCode::NOT_FOUND, "not_found", "audio not found")
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read audio file");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "io_error", e.to_string())
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn content_type(file: &str) -> &'static str {
    if file.ends_with(".mp3") {
        "audio/mpeg"
    } else if file.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_hidden_names() {
        assert!(is_plain_file_name("daily-0190.mp3"));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name(".env"));
        assert!(!is_plain_file_name("a/b.mp3"));
    }
}
