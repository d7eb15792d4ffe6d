//! API key management, backed by the key service or the local store.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use nexis_common::cloud::VERSION_HEADER;
use nexis_common::json::{extract_list, first_present, first_str, trimmed_str, Object};
use nexis_common::upstream::{join_url, FetchResult};
use nexis_common::ServiceClient;

use super::agents::SECRETS_DISABLED;
use super::RequestAuth;
use crate::auth::require_csrf;
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};
use crate::store::ApiKeyView;

const ITEM_KEYS: &[&str] = &["items", "data", "tokens", "keys", "results"];
const SECRET_KEYS: &[&str] = &["secret", "token", "api_key", "key", "value", "plaintext"];

fn prefix_of(value: &str) -> String {
    value.chars().take(10).collect()
}

pub fn normalize_api_key(raw: &Value) -> Option<ApiKeyView> {
    let obj = raw.as_object()?;
    let text = |key: &str| obj.get(key).and_then(trimmed_str);
    let pick = |keys: &[&str]| keys.iter().find_map(|k| text(k));

    let label = pick(&["label", "name", "title", "description"]).unwrap_or_else(|| "API key".to_string());
    let prefix = pick(&["prefix", "key_prefix", "token_prefix", "api_key_prefix"])
        .or_else(|| text("token").map(|t| prefix_of(&t)))
        .or_else(|| text("key").map(|k| prefix_of(&k)));
    let id = pick(&["id", "token_id", "key_id", "uuid", "tokenId", "keyId"])
        .or_else(|| prefix.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let nullable = |keys: &[&str]| first_str(obj, keys);

    Some(ApiKeyView {
        prefix: prefix.unwrap_or_else(|| prefix_of(&id)),
        label,
        created_at: nullable(&["createdAt", "created_at", "created"]),
        last_used_at: nullable(&["lastUsedAt", "last_used_at", "last_used"]),
        revoked_at: nullable(&["revokedAt", "revoked_at", "revoked"]),
        created_by: nullable(&["createdBy", "created_by", "owner", "user_id"]),
        id,
    })
}

pub fn extract_keys(data: &Value) -> Vec<ApiKeyView> {
    extract_list(data, ITEM_KEYS)
        .map(|items| items.iter().filter_map(normalize_api_key).collect())
        .unwrap_or_default()
}

/// The plaintext key in a create response.
pub fn extract_secret(data: &Value) -> Option<String> {
    match data {
        Value::String(text) => Some(text.clone()),
        Value::Object(obj) => SECRET_KEYS.iter().find_map(|k| obj.get(*k).and_then(trimmed_str)),
        _ => None,
    }
}

/// The key record in a create or revoke response.
pub fn extract_key(data: &Value) -> Option<ApiKeyView> {
    let obj: &Object = data.as_object()?;
    let candidate = first_present(obj, &["key", "token", "data", "item", "result"]).unwrap_or(data);
    normalize_api_key(candidate)
}

/// Key service base: the dedicated URL, or the cloud `account/tokens`
/// collection with the version header.
pub fn key_service(state: &AppState, api_key: &str) -> ServiceClient {
    let client = match state.config.api_keys_api_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => ServiceClient::new(state.http.clone(), url.trim_end_matches('/')),
        None => ServiceClient::new(
            state.http.clone(),
            join_url(&state.config.cloud_api_url, "account/tokens"),
        )
        .with_header(VERSION_HEADER, &state.config.cloud_api_version),
    };
    client
        .with_header("Accept", "application/json")
        .with_api_key(Some(api_key))
}

fn failure(result: &FetchResult) -> ApiError {
    ApiError::upstream_code(result.status, result.failure_text())
}

fn transport(err: nexis_common::Error) -> ApiError {
    ApiError::bad_gateway(err.to_string())
}

pub async fn list_remote(client: &ServiceClient) -> ApiResult<Vec<ApiKeyView>> {
    let result = client.fetch(Method::GET, "", None).await.map_err(transport)?;
    if !result.ok {
        return Err(failure(&result));
    }
    Ok(extract_keys(&result.data))
}

pub async fn create_remote(client: &ServiceClient, label: &str) -> ApiResult<(Option<ApiKeyView>, Option<String>)> {
    let body = json!({ "label": label, "name": label });
    let result = client.fetch(Method::POST, "", Some(&body)).await.map_err(transport)?;
    if !result.ok {
        return Err(failure(&result));
    }
    Ok((extract_key(&result.data), extract_secret(&result.data)))
}

/// `DELETE <id>`, falling back to `DELETE` with `{id}` when the item route
/// is missing or unreachable.
pub async fn revoke_remote(client: &ServiceClient, id: &str) -> ApiResult<Option<ApiKeyView>> {
    match client.fetch(Method::DELETE, &urlencoding::encode(id), None).await {
        Ok(result) if result.ok => return Ok(extract_key(&result.data)),
        Ok(result) if result.status != 404 && result.status != 405 => return Err(failure(&result)),
        _ => {}
    }
    let body = json!({ "id": id });
    let result = client.fetch(Method::DELETE, "", Some(&body)).await.map_err(transport)?;
    if !result.ok {
        return Err(failure(&result));
    }
    Ok(extract_key(&result.data))
}

// ============================================================================
// Handlers
// ============================================================================

/// Keys from the local store or the key service.
pub async fn load_keys(state: &AppState, api_key: &str) -> ApiResult<Vec<ApiKeyView>> {
    if state.config.local_api_keys {
        Ok(state.api_keys.list().await)
    } else {
        list_remote(&key_service(state, api_key)).await
    }
}

/// GET /api/keys
pub async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let items = load_keys(&state, auth.require_api_key()?).await?;
    Ok(Json(json!({ "items": items })))
}

/// POST /api/keys `{label}`
pub async fn create_key(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;
    let api_key = auth.require_api_key()?;

    let body = read_json(&body);
    let label = body
        .get("label")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ApiError::validation("label is required"))?;

    let (key, secret) = if state.config.local_api_keys {
        let secrets = state
            .secrets
            .as_ref()
            .ok_or_else(|| ApiError::validation(SECRETS_DISABLED))?;
        let (view, secret) = state
            .api_keys
            .create(secrets, label, Some(auth.identity.id.clone()))
            .await?;
        (Some(view), Some(secret))
    } else {
        create_remote(&key_service(&state, api_key), label).await?
    };
    info!(label, "API key created");
    Ok((StatusCode::CREATED, Json(json!({ "key": key, "secret": secret }))).into_response())
}

/// DELETE /api/keys `{id}`
pub async fn revoke_key(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;
    let api_key = auth.require_api_key()?;

    let body = read_json(&body);
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("id is required"))?;

    let key = if state.config.local_api_keys {
        let revoked = state.api_keys.revoke(id).await?;
        Some(revoked.ok_or_else(|| ApiError::NotFound("API key not found".to_string()))?)
    } else {
        revoke_remote(&key_service(&state, api_key), id).await?
    };
    info!(id, "API key revoked");
    Ok(Json(json!({ "key": key })))
}
