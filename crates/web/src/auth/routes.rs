//! `/api/auth/*` handlers.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{bearer_token, require_csrf, set_cookies, SessionCookies, API_KEY_COOKIE, PRIVY_COOKIE};
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};

fn status_or(status: u16, fallback: StatusCode) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(fallback)
}

fn body_str<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Validate a cloud key against `/auth/me` and store it as the session.
async fn establish_api_key_session(
    state: &AppState,
    api_key: &str,
    failure: &str,
) -> ApiResult<Response> {
    let policy = state.cookie_policy();
    let me = state.cloud(Some(api_key)).me().await?;
    if !me.ok {
        warn!(status = me.status, "Cloud API rejected session key");
        return Ok((
            status_or(me.status, StatusCode::UNAUTHORIZED),
            set_cookies(vec![policy.clear(API_KEY_COOKIE)]),
            Json(json!({ "error": failure, "detail": me.data })),
        )
            .into_response());
    }
    Ok((
        set_cookies(vec![policy.session(API_KEY_COOKIE, api_key)]),
        Json(json!({ "user": me.data })),
    )
        .into_response())
}

/// POST /api/auth/api-key
pub async fn login_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    require_csrf(&headers)?;
    let body = read_json(&body);
    let api_key = body_str(&body, "apiKey").ok_or_else(|| ApiError::validation("apiKey is required"))?;
    establish_api_key_session(&state, api_key, "Invalid API key").await
}

/// POST /api/auth/device-code
pub async fn device_code(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    require_csrf(&headers)?;
    let body = read_json(&body);
    let client_id = body_str(&body, "client_id").unwrap_or(&state.config.device_client_id);
    let scope = body_str(&body, "scope").unwrap_or(&state.config.device_scope);

    let result = state.cloud(None).device_code(client_id, scope).await?;
    Ok((status_or(result.status, StatusCode::BAD_GATEWAY), Json(result.data)).into_response())
}

/// POST /api/auth/device-token
pub async fn device_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    require_csrf(&headers)?;
    let body = read_json(&body);
    let code = body_str(&body, "device_code").ok_or_else(|| ApiError::validation("device_code is required"))?;

    let result = state.cloud(None).device_token(code).await?;
    if !result.ok {
        // Pending authorisation is reported here too; the page keeps polling.
        return Ok((status_or(result.status, StatusCode::BAD_GATEWAY), Json(result.data)).into_response());
    }
    let token = body_str(&result.data, "access_token")
        .ok_or_else(|| ApiError::bad_gateway("Missing access token"))?;
    info!("Device authorisation completed");
    establish_api_key_session(&state, token, "Token validation failed").await
}

/// GET /api/auth/session
pub async fn session(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    let cookies = SessionCookies::from_headers(&headers);
    let policy = state.cookie_policy();
    let mut cleared = Vec::new();
    let mut api_user = None;

    if let Some(key) = cookies.api_key.as_deref() {
        let me = state.cloud(Some(key)).me().await?;
        if me.ok {
            api_user = Some(me.data);
        } else {
            cleared.push(policy.clear(API_KEY_COOKIE));
            if cookies.privy_token.is_none() || state.privy.is_none() {
                return Ok((
                    status_or(me.status, StatusCode::UNAUTHORIZED),
                    set_cookies(cleared),
                    Json(json!({ "error": "Session expired", "detail": me.data, "hasApiKey": false })),
                )
                    .into_response());
            }
        }
    }
    let has_api_key = api_user.is_some();

    if let Some(verifier) = state.privy.as_ref() {
        let Some(token) = cookies.privy_token.as_deref() else {
            return Ok((
                StatusCode::UNAUTHORIZED,
                set_cookies(cleared),
                Json(json!({ "error": "Not authenticated", "hasApiKey": has_api_key })),
            )
                .into_response());
        };
        return Ok(match verifier.verify(token) {
            Ok(claims) => (
                set_cookies(cleared),
                Json(json!({ "session": claims, "hasApiKey": has_api_key, "authMethod": "privy" })),
            )
                .into_response(),
            Err(e) => {
                cleared.push(policy.clear(PRIVY_COOKIE));
                (
                    StatusCode::UNAUTHORIZED,
                    set_cookies(cleared),
                    Json(json!({ "error": e.to_string(), "hasApiKey": has_api_key })),
                )
                    .into_response()
            }
        });
    }

    Ok(match api_user {
        Some(user) => Json(json!({ "user": user, "hasApiKey": true, "authMethod": "api-key" })).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Not authenticated", "hasApiKey": false })),
        )
            .into_response(),
    })
}

/// POST /api/auth/privy
pub async fn login_privy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    require_csrf(&headers)?;
    let verifier = state
        .privy
        .as_ref()
        .ok_or_else(|| ApiError::NotConfigured("Privy is not configured".to_string()))?;

    let body = read_json(&body);
    let token = bearer_token(&headers)
        .or_else(|| body_str(&body, "token").map(str::to_string))
        .ok_or_else(|| ApiError::validation("token is required"))?;

    let policy = state.cookie_policy();
    Ok(match verifier.verify(&token) {
        Ok(claims) => (
            set_cookies(vec![policy.session(PRIVY_COOKIE, &token)]),
            Json(json!({ "session": claims })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            set_cookies(vec![policy.clear(PRIVY_COOKIE)]),
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    })
}

/// POST /api/auth/logout
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    require_csrf(&headers)?;
    let policy = state.cookie_policy();
    Ok((
        set_cookies(vec![policy.clear(API_KEY_COOKIE), policy.clear(PRIVY_COOKIE)]),
        Json(json!({ "ok": true })),
    )
        .into_response())
}
