//! Prebuilt agent templates read from the templates directory.
//!
//! Each template is a directory holding a `README.md` and/or a
//! `docker-compose.yml` (or `.yaml`).

use axum::{
    extract::{Path as UrlPath, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTemplate {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub docker_compose: Option<String>,
    pub readme: Option<String>,
}

fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `my-agent_v2` → `My Agent V2`
pub fn title_from_slug(slug: &str) -> String {
    slug.split(&['-', '_'][..])
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// First non-blank README line that is not a heading, an image or a code
/// fence marker. Lines inside a fenced block still count.
pub fn readme_description(readme: &str) -> Option<String> {
    readme
        .lines()
        .map(str::trim)
        .find(|line| {
            !line.is_empty() && !line.starts_with('#') && !line.starts_with("![") && !line.starts_with("```")
        })
        .map(str::to_string)
}

fn readme_title(readme: &str) -> Option<String> {
    readme
        .lines()
        .find_map(|line| line.trim().strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

async fn read_optional(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

pub async fn load_template(root: &Path, slug: &str) -> Option<AgentTemplate> {
    if !is_valid_slug(slug) {
        return None;
    }
    let dir = root.join(slug);
    let readme = read_optional(&dir.join("README.md")).await;
    let compose = match read_optional(&dir.join("docker-compose.yml")).await {
        Some(compose) => Some(compose),
        None => read_optional(&dir.join("docker-compose.yaml")).await,
    };
    if readme.is_none() && compose.is_none() {
        return None;
    }

    let fallback = title_from_slug(slug);
    let name = readme.as_deref().and_then(readme_title).unwrap_or_else(|| fallback.clone());
    let description = readme.as_deref().and_then(readme_description).unwrap_or(fallback);
    Some(AgentTemplate {
        slug: slug.to_string(),
        name,
        description,
        docker_compose: compose,
        readme,
    })
}

/// Every template directory under `root`, sorted by slug.
pub async fn list_templates(root: &Path) -> Vec<AgentTemplate> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "Templates directory unavailable");
            return Vec::new();
        }
    };
    let mut slugs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
            slugs.push(name.to_string());
        }
    }
    slugs.sort();

    let mut templates = Vec::new();
    for slug in slugs {
        if let Some(template) = load_template(root, &slug).await {
            templates.push(template);
        }
    }
    templates
}

/// GET /api/templates
pub async fn templates(State(state): State<Arc<AppState>>) -> Json<Value> {
    let templates = list_templates(&state.config.templates_dir).await;
    Json(json!({ "templates": templates }))
}

/// GET /api/templates/:slug
pub async fn template(State(state): State<Arc<AppState>>, UrlPath(slug): UrlPath<String>) -> ApiResult<Json<Value>> {
    let template = load_template(&state.config.templates_dir, &slug)
        .await
        .ok_or_else(|| ApiError::NotFound("Template not found".to_string()))?;
    Ok(Json(json!({ "template": template })))
}
