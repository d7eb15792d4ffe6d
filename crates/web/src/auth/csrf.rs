//! Double-submit CSRF protection.

use axum::{
    extract::State,
    http::{header::CACHE_CONTROL, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use super::{set_cookies, SessionCookies, CSRF_HEADER};
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// The `x-csrf-token` header must be present and equal the CSRF cookie.
pub fn require_csrf(headers: &HeaderMap) -> ApiResult<()> {
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let cookie = SessionCookies::from_headers(headers).csrf;
    match (header, cookie) {
        (Some(header), Some(cookie)) if header == cookie => Ok(()),
        _ => Err(ApiError::Csrf),
    }
}

/// GET /api/auth/csrf
pub async fn csrf_token(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let token = SessionCookies::from_headers(&headers)
        .csrf
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let cookie = state.cookie_policy().csrf(&token);
    (
        [(CACHE_CONTROL, "no-store")],
        set_cookies(vec![cookie]),
        Json(json!({ "token": token })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header::COOKIE, HeaderValue};

    fn headers(cookie: Option<&'static str>, token: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = cookie {
            headers.insert(COOKIE, HeaderValue::from_static(cookie));
        }
        if let Some(token) = token {
            headers.insert(CSRF_HEADER, HeaderValue::from_static(token));
        }
        headers
    }

    #[test]
    fn test_matching_tokens_pass() {
        assert!(require_csrf(&headers(Some("nexis_csrf=abc"), Some("abc"))).is_ok());
    }

    #[test]
    fn test_mismatch_or_missing_rejected() {
        assert!(matches!(
            require_csrf(&headers(Some("nexis_csrf=abc"), Some("abd"))),
            Err(ApiError::Csrf)
        ));
        assert!(require_csrf(&headers(None, Some("abc"))).is_err());
        assert!(require_csrf(&headers(Some("nexis_csrf=abc"), None)).is_err());
        assert!(require_csrf(&headers(None, None)).is_err());
    }
}
