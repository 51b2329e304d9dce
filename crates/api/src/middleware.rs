use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use std::sync::Arc;

use civicbrief_core::UserId;

use crate::app::AppServices;
use crate::context::UserContext;

pub const USER_ID_HEADER: &str = "x-user-id";

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub async fn user_context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let user_id = extract_user_id(req.headers())?;
    req.extensions_mut().insert(UserContext::new(user_id));
    Ok(next.run(req).await)
}

fn extract_user_id(headers: &HeaderMap) -> Result<UserId, StatusCode> {
    let header = headers
        .get(USER_ID_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let value = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?.trim();
    if value.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    value.parse().map_err(|_| StatusCode::UNAUTHORIZED)
}

/// Guards operator routes with the configured `BRIEF_ADMIN_TOKEN`.
pub async fn admin_token_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = req
        .extensions()
        .get::<Arc<AppServices>>()
        .and_then(|services| services.config.admin_token.clone());
    check_admin_token(req.headers(), expected.as_deref())?;
    Ok(next.run(req).await)
}

fn check_admin_token(headers: &HeaderMap, expected: Option<&str>) -> Result<(), StatusCode> {
    let expected = expected.ok_or(StatusCode::FORBIDDEN)?;
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if provided == expected {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_or_malformed_header_is_unauthorized() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_user_id(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(extract_user_id(&headers), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn valid_header_yields_user() {
        let user = UserId::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&format!(" {user} ")).unwrap(),
        );
        assert_eq!(extract_user_id(&headers), Ok(user));
    }

    #[test]
    fn admin_routes_need_a_configured_matching_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(check_admin_token(&headers, None), Err(StatusCode::FORBIDDEN));
        assert_eq!(
            check_admin_token(&headers, Some("s3cret")),
            Err(StatusCode::UNAUTHORIZED)
        );

        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("wrong"));
        assert_eq!(
            check_admin_token(&headers, Some("s3cret")),
            Err(StatusCode::FORBIDDEN)
        );

        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert_eq!(check_admin_token(&headers, Some("s3cret")), Ok(()));
        assert_eq!(check_admin_token(&headers, None), Err(StatusCode::FORBIDDEN));
    }
}
