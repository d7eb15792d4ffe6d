//! Agent knowledge files.

use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use nexis_common::json::{extract_list, first_present, first_str, to_number};
use nexis_common::upstream::{Candidate, FetchResult};
use nexis_common::{Result, ServiceClient};

use super::agents::{adapter_error, AppIdQuery};
use super::{require_base, RequestAuth};
use crate::auth::require_csrf;
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};
use crate::store::{now_iso, sanitize_filename, sanitize_id};

/// Per-file upload limit
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeFile {
    pub name: String,
    pub size: u64,
    pub updated_at: String,
}

fn normalize_file(raw: &Value) -> Option<KnowledgeFile> {
    let obj = raw.as_object()?;
    let name = first_str(obj, &["name", "filename", "file_name"])?;
    let size = first_present(obj, &["size", "bytes", "length"])
        .and_then(to_number)
        .map(|n| n.max(0.0) as u64)
        .unwrap_or(0);
    let updated_at = first_str(obj, &["updatedAt", "updated_at", "modifiedAt", "modified_at"])
        .unwrap_or_else(now_iso);
    Some(KnowledgeFile { name, size, updated_at })
}

/// Files newest first.
pub fn extract_files(data: &Value) -> Vec<KnowledgeFile> {
    let mut files: Vec<KnowledgeFile> = extract_list(data, &["files", "items", "data", "knowledge"])
        .map(|items| items.iter().filter_map(normalize_file).collect())
        .unwrap_or_default();
    files.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    files
}

pub async fn list_knowledge(client: &ServiceClient, app_id: &str) -> Result<Vec<KnowledgeFile>> {
    let Some(app_id) = sanitize_id(app_id) else {
        return Ok(Vec::new());
    };
    let encoded = urlencoding::encode(&app_id);
    let candidates = [
        Candidate::get(format!("knowledge?appId={encoded}")),
        Candidate::get(format!("knowledge/{encoded}")),
        Candidate::get(format!("agents/{encoded}/knowledge")),
        Candidate::get(format!("{encoded}/knowledge")),
    ];
    let result = client.fetch_first(&candidates, None).await?;
    Ok(extract_files(&result.data))
}

/// Upstream failure: the text body, else `fallback`, with the upstream status.
fn relay(result: FetchResult, fallback: &str) -> Response {
    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::BAD_GATEWAY);
    if result.ok {
        return (StatusCode::OK, Json(result.data)).into_response();
    }
    let message = match &result.data {
        Value::String(text) => text.clone(),
        _ => fallback.to_string(),
    };
    (status, Json(json!({ "error": message }))).into_response()
}

/// GET /api/agents/knowledge?appId=
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AppIdQuery>,
) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let app_id = query.required()?;
    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let files = list_knowledge(&auth.client(&state, base), app_id)
        .await
        .map_err(adapter_error)?;
    Ok(Json(json!({ "files": files })))
}

/// POST /api/agents/knowledge (multipart: `appId`, `files`)
pub async fn upload_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;

    let mut app_id = None;
    let mut files: Vec<(String, Bytes)> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("Invalid upload: {e}")))?
    {
        match field.name() {
            Some("appId") => {
                app_id = Some(field.text().await.map_err(|e| ApiError::validation(e.to_string()))?);
            }
            Some("files") => {
                let Some(name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let data = field.bytes().await.map_err(|e| ApiError::validation(e.to_string()))?;
                files.push((name, data));
            }
            _ => {}
        }
    }

    let app_id = app_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::validation("appId is required"))?;
    let app_id = sanitize_id(&app_id).ok_or_else(|| ApiError::validation("Invalid appId"))?;
    if files.is_empty() {
        return Err(ApiError::validation("No files uploaded"));
    }

    let mut form = Form::new().text("appId", app_id.clone());
    for (name, data) in files {
        if data.len() > MAX_FILE_SIZE {
            return Err(ApiError::validation(format!(
                "File {name} exceeds {}MB limit.",
                MAX_FILE_SIZE / (1024 * 1024)
            )));
        }
        let safe_name = sanitize_filename(&name)
            .ok_or_else(|| ApiError::validation(format!("Invalid file name: {name}")))?;
        form = form.part("files", Part::bytes(data.to_vec()).file_name(safe_name));
    }

    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let client = auth.client(&state, base);
    let response = client
        .http()
        .post(client.url("knowledge"))
        .headers(client.headers().clone())
        .multipart(form)
        .send()
        .await
        .map_err(|e| ApiError::bad_gateway(e.to_string()))?;
    let result = FetchResult::from_response(response).await?;
    info!(app_id = %app_id, status = result.status, "Knowledge upload relayed");
    Ok(relay(result, "Unable to upload files."))
}

/// DELETE /api/agents/knowledge `{appId, filename}`
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;

    let body = read_json(&body);
    let app_id = body.get("appId").and_then(Value::as_str).filter(|s| !s.is_empty());
    let filename = body.get("filename").and_then(Value::as_str).filter(|s| !s.is_empty());
    let (Some(app_id), Some(filename)) = (app_id, filename) else {
        return Err(ApiError::validation("appId and filename are required"));
    };
    let app_id = sanitize_id(app_id).ok_or_else(|| ApiError::validation("Invalid appId"))?;
    let filename = sanitize_filename(filename).ok_or_else(|| ApiError::validation("Invalid file name"))?;

    let base = require_base(&state.config.agents_api_url, "Agents")?;
    let payload = json!({ "appId": app_id, "filename": filename });
    let result = auth
        .client(&state, base)
        .fetch(Method::DELETE, "knowledge", Some(&payload))
        .await
        .map_err(adapter_error)?;
    Ok(relay(result, "Unable to delete file."))
}
