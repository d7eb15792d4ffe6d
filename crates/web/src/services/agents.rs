//! Agent configuration adapter.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use nexis_common::json::{extract_list, first_present, first_str, pick_string, string_list, Object};
use nexis_common::upstream::Candidate;
use nexis_common::{Error, Result, ServiceClient};

use super::knowledge::{list_knowledge, KnowledgeFile};
use super::{require_base, RequestAuth};
use crate::auth::require_csrf;
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};
use crate::store::{now_iso, sanitize_id};

pub const SECRETS_DISABLED: &str = "Secrets storage is disabled. Set NEXIS_CONSOLE_ENCRYPTION_KEY.";

const LIST_KEYS: &[&str] = &["items", "data", "agents", "configs", "results"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestFormat {
    #[default]
    Generic,
    Openai,
}

/// Agent settings for one CVM; secret values are sealed envelopes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigRecord {
    pub app_id: String,
    pub name: String,
    pub description: Option<String>,
    pub endpoint_url: Option<String>,
    pub model: Option<String>,
    pub request_format: RequestFormat,
    pub prompt: Option<String>,
    pub env_secrets: BTreeMap<String, String>,
    pub header_secrets: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

/// What the browser sees: secret names, never values
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigView {
    pub app_id: String,
    pub name: String,
    pub description: Option<String>,
    pub endpoint_url: Option<String>,
    pub model: Option<String>,
    pub request_format: RequestFormat,
    pub prompt: Option<String>,
    pub env_keys: Vec<String>,
    pub header_keys: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<AgentConfigRecord> for AgentConfigView {
    fn from(record: AgentConfigRecord) -> Self {
        Self {
            env_keys: record.env_secrets.keys().cloned().collect(),
            header_keys: record.header_secrets.keys().cloned().collect(),
            app_id: record.app_id,
            name: record.name,
            description: record.description,
            endpoint_url: record.endpoint_url,
            model: record.model,
            request_format: record.request_format,
            prompt: record.prompt,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Fields sent on upsert; `None` secrets leave the stored ones alone.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub description: Option<String>,
    pub endpoint_url: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub request_format: RequestFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_secrets: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_secrets: Option<BTreeMap<String, String>>,
}

fn trimmed_pick(obj: &Object, keys: &[&str]) -> Option<String> {
    pick_string(obj, keys).map(|s| s.trim().to_string())
}

fn secret_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(obj)) = value else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter(|(key, _)| !key.is_empty())
        .filter_map(|(key, raw)| match raw {
            Value::String(s) => Some((key.clone(), s.clone())),
            Value::Null => None,
            other => Some((key.clone(), other.to_string())),
        })
        .collect()
}

fn keys_only(keys: Vec<String>) -> BTreeMap<String, String> {
    keys.into_iter().map(|k| (k, String::new())).collect()
}

/// Normalise one config object; camelCase and snake_case are both accepted.
pub fn normalize_config(raw: &Value, fallback_app_id: &str) -> Option<AgentConfigRecord> {
    let obj = raw.as_object()?;
    let app_id = trimmed_pick(obj, &["appId", "app_id"]).unwrap_or_else(|| fallback_app_id.to_string());
    let name = trimmed_pick(obj, &["name"])
        .unwrap_or_else(|| format!("Agent {}", app_id.chars().take(6).collect::<String>()));

    let env_keys = first_present(obj, &["envKeys", "env_keys"]).map(string_list).unwrap_or_default();
    let header_keys = first_present(obj, &["headerKeys", "header_keys"])
        .map(string_list)
        .unwrap_or_default();
    let mut env_secrets = secret_map(first_present(obj, &["envSecrets", "env_secrets", "envs"]));
    let mut header_secrets = secret_map(first_present(obj, &["headerSecrets", "header_secrets", "headers"]));
    if env_secrets.is_empty() && !env_keys.is_empty() {
        env_secrets = keys_only(env_keys);
    }
    if header_secrets.is_empty() && !header_keys.is_empty() {
        header_secrets = keys_only(header_keys);
    }

    let request_format = match first_present(obj, &["requestFormat", "request_format"]).and_then(Value::as_str) {
        Some("openai") => RequestFormat::Openai,
        _ => RequestFormat::Generic,
    };
    let now = now_iso();

    Some(AgentConfigRecord {
        name,
        description: first_str(obj, &["description"]),
        endpoint_url: first_str(obj, &["endpointUrl", "endpoint_url"]),
        model: first_str(obj, &["model"]),
        request_format,
        prompt: first_str(obj, &["prompt"]),
        env_secrets,
        header_secrets,
        created_at: first_str(obj, &["createdAt", "created_at"]).unwrap_or_else(|| now.clone()),
        updated_at: first_str(obj, &["updatedAt", "updated_at"]).unwrap_or(now),
        app_id,
    })
}

fn truthy(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    })
}

/// Unwrap `{config}`, `{data: {config}}` or `{data}` envelopes.
pub fn normalize_config_payload(data: &Value, fallback_app_id: &str) -> Option<AgentConfigRecord> {
    let Some(obj) = data.as_object() else {
        return normalize_config(data, fallback_app_id);
    };
    if let Some(config) = truthy(obj.get("config")) {
        return normalize_config(config, fallback_app_id);
    }
    if let Some(nested @ Value::Object(inner)) = obj.get("data") {
        return match truthy(inner.get("config")) {
            Some(config) => normalize_config(config, fallback_app_id),
            None => normalize_config(nested, fallback_app_id),
        };
    }
    normalize_config(data, fallback_app_id)
}

pub async fn get_agent_config(client: &ServiceClient, app_id: &str) -> Result<Option<AgentConfigRecord>> {
    let Some(app_id) = sanitize_id(app_id) else {
        return Ok(None);
    };
    let encoded = urlencoding::encode(&app_id);
    let candidates = [
        Candidate::get(format!("config?appId={encoded}")),
        Candidate::get(format!("configs/{encoded}")),
        Candidate::get(format!("agents/{encoded}/config")),
        Candidate::get(format!("{encoded}/config")),
    ];
    let result = client.fetch_first(&candidates, None).await?;
    Ok(normalize_config_payload(&result.data, &app_id))
}

pub async fn upsert_agent_config(
    client: &ServiceClient,
    app_id: &str,
    update: &AgentConfigUpdate,
) -> Result<AgentConfigRecord> {
    let app_id = sanitize_id(app_id).ok_or_else(|| Error::validation("Invalid appId."))?;
    let encoded = urlencoding::encode(&app_id);
    let candidates = [
        Candidate::new(Method::POST, "config"),
        Candidate::new(Method::PUT, format!("configs/{encoded}")),
        Candidate::new(Method::POST, format!("configs/{encoded}")),
    ];

    let mut body = Map::new();
    body.insert("appId".to_string(), Value::String(app_id.clone()));
    if let Value::Object(fields) = serde_json::to_value(update)? {
        body.extend(fields);
    }

    let result = client.fetch_first(&candidates, Some(&Value::Object(body))).await?;
    normalize_config_payload(&result.data, &app_id)
        .ok_or_else(|| Error::upstream(502, "Agent configuration response was not recognized."))
}

pub async fn list_agent_configs(client: &ServiceClient) -> Result<Vec<AgentConfigView>> {
    let candidates = [
        Candidate::get("configs"),
        Candidate::get("agents"),
        Candidate::get("list"),
        Candidate::get(""),
    ];
    let result = client.fetch_first(&candidates, None).await?;
    Ok(extract_list(&result.data, LIST_KEYS)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| normalize_config(item, "agent"))
                .map(AgentConfigView::from)
                .collect()
        })
        .unwrap_or_default())
}

/// `KEY=VALUE` lines where both sides must be non-empty.
pub fn parse_key_values(input: &str) -> (BTreeMap<String, String>, Vec<String>) {
    let mut entries = BTreeMap::new();
    let mut invalid = Vec::new();
    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => invalid.push(trimmed.to_string()),
        }
    }
    (entries, invalid)
}

/// Adapter failures surface as 502 with the upstream message.
pub(crate) fn adapter_error(err: Error) -> ApiError {
    match err {
        Error::NotConfigured(service) => ApiError::service_not_configured(&service),
        Error::Validation(msg) => ApiError::Validation(msg),
        other => ApiError::bad_gateway(other.to_string()),
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AppIdQuery {
    #[serde(rename = "appId")]
    pub app_id: Option<String>,
}

impl AppIdQuery {
    pub fn required(&self) -> ApiResult<&str> {
        self.app_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::validation("appId is required"))
    }
}

/// GET /api/agents
pub async fn list_agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let items = list_agent_configs(&auth.client(&state, base))
        .await
        .map_err(adapter_error)?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    config: Option<AgentConfigView>,
    knowledge: Vec<KnowledgeFile>,
    secrets_enabled: bool,
}

/// GET /api/agents/config?appId=
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AppIdQuery>,
) -> ApiResult<Json<ConfigResponse>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let app_id = query.required()?;
    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let client = auth.client(&state, base);

    let config = get_agent_config(&client, app_id).await.map_err(adapter_error)?;
    let knowledge = list_knowledge(&client, app_id).await.map_err(adapter_error)?;
    Ok(Json(ConfigResponse {
        config: config.map(AgentConfigView::from),
        knowledge,
        secrets_enabled: state.secrets.is_some(),
    }))
}

fn optional_text(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// POST /api/agents/config
pub async fn post_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;

    let body = read_json(&body);
    let app_id = body
        .get("appId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("appId is required"))?;

    let mut update = AgentConfigUpdate {
        name: optional_text(&body, "name"),
        description: optional_text(&body, "description"),
        endpoint_url: optional_text(&body, "endpointUrl"),
        model: optional_text(&body, "model"),
        prompt: optional_text(&body, "prompt"),
        request_format: match body.get("requestFormat").and_then(Value::as_str) {
            Some("openai") => RequestFormat::Openai,
            _ => RequestFormat::Generic,
        },
        ..AgentConfigUpdate::default()
    };

    let mut invalid_lines = Vec::new();
    for (field, label) in [("envText", "env"), ("headerText", "header")] {
        let Some(text) = body.get(field).and_then(Value::as_str) else {
            continue;
        };
        if state.secrets.is_none() && !text.trim().is_empty() {
            return Err(ApiError::validation(SECRETS_DISABLED));
        }
        let (entries, invalid) = parse_key_values(text);
        invalid_lines.extend(invalid.into_iter().map(|line| format!("{label}: {line}")));
        let sealed = match state.secrets.as_ref() {
            Some(secrets) => entries
                .into_iter()
                .map(|(k, v)| secrets.seal(&v).map(|sealed| (k, sealed)))
                .collect::<Result<BTreeMap<_, _>>>()?,
            None => BTreeMap::new(),
        };
        if label == "env" {
            update.env_secrets = Some(sealed);
        } else {
            update.header_secrets = Some(sealed);
        }
    }
    if !invalid_lines.is_empty() {
        return Err(ApiError::validation("Invalid key/value lines").with_extra("invalid", json!(invalid_lines)));
    }

    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let updated = upsert_agent_config(&auth.client(&state, base), app_id, &update)
        .await
        .map_err(adapter_error)?;
    debug!(app_id = %updated.app_id, "Agent configuration updated");
    Ok(Json(json!({
        "config": AgentConfigView::from(updated),
        "secretsEnabled": state.secrets.is_some(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_normalize_snake_and_camel() {
        let camel = json!({"appId": "app_1", "endpointUrl": " http://a ", "requestFormat": "openai"});
        let snake = json!({"app_id": "app_1", "endpoint_url": "http://a", "request_format": "openai"});
        let a = normalize_config(&camel, "x").unwrap();
        let b = normalize_config(&snake, "x").unwrap();
        assert_eq!(a.endpoint_url.as_deref(), Some("http://a"));
        assert_eq!(a.endpoint_url, b.endpoint_url);
        assert_eq!(a.request_format, RequestFormat::Openai);
        assert_eq!(a.name, "Agent app_1");
    }

    #[test]
    fn test_default_name_and_key_only_secrets() {
        let raw = json!({"envKeys": ["A", " ", "B"], "headers": {"X-Token": "v1:..."}, "requestFormat": "other"});
        let record = normalize_config(&raw, "abcdefghij").unwrap();
        assert_eq!(record.app_id, "abcdefghij");
        assert_eq!(record.name, "Agent abcdef");
        assert_eq!(record.request_format, RequestFormat::Generic);
        let view = AgentConfigView::from(record);
        assert_eq!(view.env_keys, vec!["A", "B"]);
        assert_eq!(view.header_keys, vec!["X-Token"]);
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("headerSecrets").is_none());
        assert!(!json.to_string().contains("v1:"));
    }

    #[test]
    fn test_payload_envelopes() {
        let inner = json!({"appId": "app_9", "name": "Bot"});
        for payload in [
            json!({"config": inner.clone()}),
            json!({"data": {"config": inner.clone()}}),
            json!({"data": inner.clone()}),
            inner.clone(),
        ] {
            let record = normalize_config_payload(&payload, "fallback").unwrap();
            assert_eq!(record.app_id, "app_9");
            assert_eq!(record.name, "Bot");
        }
        assert!(normalize_config_payload(&json!("text"), "x").is_none());
    }

    #[test]
    fn test_parse_key_values() {
        let (entries, invalid) = parse_key_values("# c\nA=1\n\n=x\nB=\nC = two words\nnoequals");
        assert_eq!(entries.get("A").map(String::as_str), Some("1"));
        assert_eq!(entries.get("C").map(String::as_str), Some("two words"));
        assert_eq!(invalid, vec!["=x", "B=", "noequals"]);
    }

    #[tokio::test]
    async fn test_get_config_skips_past_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .and(query_param("appId", "app_1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/configs/app_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"config": {"name": "Helper"}})))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), server.uri());
        let record = get_agent_config(&client, "app_1").await.unwrap().unwrap();
        assert_eq!(record.name, "Helper");
        assert_eq!(record.app_id, "app_1");

        assert!(get_agent_config(&client, "../bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_falls_back_to_put() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/configs/app_1"))
            .and(body_partial_json(json!({"appId": "app_1", "requestFormat": "openai", "model": null})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"appId": "app_1", "requestFormat": "openai"})))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), server.uri());
        let update = AgentConfigUpdate {
            request_format: RequestFormat::Openai,
            ..AgentConfigUpdate::default()
        };
        let record = upsert_agent_config(&client, "app_1", &update).await.unwrap();
        assert_eq!(record.request_format, RequestFormat::Openai);
    }

    #[tokio::test]
    async fn test_list_stops_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/configs"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), server.uri());
        let err = list_agent_configs(&client).await.unwrap_err();
        assert_eq!(err.to_string(), "db down");
    }

    #[tokio::test]
    async fn test_list_accepts_wrapped_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/configs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "agents": [{"appId": "app_1"}, "junk", {"app_id": "app_2", "name": "Two"}]
            })))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), server.uri());
        let items = list_agent_configs(&client).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].name, "Two");
    }
}
