//! Test chat against a configured agent endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use nexis_common::json::{path, trimmed_str};
use nexis_common::SecretBox;

use super::agents::{get_agent_config, AgentConfigRecord, RequestFormat};
use super::{require_base, RequestAuth};
use crate::auth::require_csrf;
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};

/// Request body for the agent endpoint.
pub fn build_payload(config: &AgentConfigRecord, message: &str) -> Value {
    match config.request_format {
        RequestFormat::Openai => {
            let mut messages = Vec::new();
            if let Some(prompt) = config.prompt.as_deref().filter(|p| !p.is_empty()) {
                messages.push(json!({ "role": "system", "content": prompt }));
            }
            messages.push(json!({ "role": "user", "content": message }));
            let mut payload = json!({ "messages": messages });
            if let Some(model) = &config.model {
                payload["model"] = json!(model);
            }
            payload
        }
        RequestFormat::Generic => {
            let mut payload = json!({ "message": message });
            if let Some(prompt) = config.prompt.as_deref().filter(|p| !p.is_empty()) {
                payload["prompt"] = json!(prompt);
            }
            if let Some(model) = &config.model {
                payload["model"] = json!(model);
            }
            payload
        }
    }
}

/// Reply text from the common agent response shapes.
pub fn extract_reply(data: &Value) -> Option<String> {
    if let Value::String(text) = data {
        return Some(text.clone()).filter(|t| !t.trim().is_empty());
    }
    let candidates = [
        path(data, &["reply"]),
        path(data, &["response"]),
        path(data, &["message"]),
        path(data, &["content"]),
        data.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| path(c, &["message", "content"])),
        data.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("text")),
    ];
    candidates.into_iter().flatten().find_map(trimmed_str)
}

/// Decrypted header secrets; key-only entries are skipped.
fn open_headers(secrets: &SecretBox, sealed: &std::collections::BTreeMap<String, String>) -> ApiResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in sealed.iter().filter(|(_, v)| !v.is_empty()) {
        let plain = secrets.open(value)?;
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&plain)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid agent header secret"),
        }
    }
    Ok(headers)
}

/// POST /api/agents/chat `{appId, message}`
pub async fn chat(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;

    let body = read_json(&body);
    let app_id = body.get("appId").and_then(Value::as_str).filter(|s| !s.is_empty());
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let (Some(app_id), Some(message)) = (app_id, message) else {
        return Err(ApiError::validation("appId and message are required"));
    };

    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let config = get_agent_config(&auth.client(&state, base), app_id)
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("Agent configuration not found".to_string()))?;
    let endpoint = config
        .endpoint_url
        .clone()
        .ok_or_else(|| ApiError::validation("Endpoint URL is not configured"))?;

    let has_header_secrets = config.header_secrets.values().any(|v| !v.is_empty());
    let extra_headers = match (&state.secrets, has_header_secrets) {
        (_, false) => HeaderMap::new(),
        (Some(secrets), true) => open_headers(secrets, &config.header_secrets)?,
        (None, true) => return Err(ApiError::validation("Secrets storage is disabled")),
    };

    debug!(app_id, format = ?config.request_format, "Sending test chat");
    let response = state
        .http
        .post(&endpoint)
        .header(ACCEPT, "application/json")
        .headers(extra_headers)
        .json(&build_payload(&config, message))
        .send()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if !status.is_success() {
        let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Ok((
            status,
            Json(json!({
                "error": format!("Agent responded with {}", status.as_u16()),
                "detail": raw,
            })),
        )
            .into_response());
    }

    let data = serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| Value::String(raw.clone()));
    let reply = extract_reply(&data).unwrap_or_else(|| raw.clone());
    Ok(Json(json!({ "reply": reply, "raw": data })).into_response())
}
