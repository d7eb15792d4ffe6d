//! Server half of the deploy wizard.
//!
//! The browser sends its draft here to be checked against the live node list
//! and provisioned. Env values are sealed in the browser with the returned
//! `app_env_encrypt_pubkey` and committed through `/api/cvms`, so plaintext
//! never reaches the console.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use nexis_common::deploy::{build_compose_template, parse_ports, DeployDraft, ProvisionResponse};

use super::RequestAuth;
use crate::auth::require_csrf;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Parse a wizard draft, regenerating the SSH pre-launch script when keys
/// were given without one.
pub fn parse_draft(body: &[u8]) -> ApiResult<DeployDraft> {
    let mut draft: DeployDraft =
        serde_json::from_slice(body).map_err(|_| ApiError::validation("Invalid deployment draft."))?;
    if !draft.ssh_keys.trim().is_empty() && draft.pre_launch_script.trim().is_empty() {
        draft.apply_ssh_keys();
    }
    Ok(draft)
}

/// POST /api/deploy/provision
pub async fn provision(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ProvisionResponse>> {
    let auth = RequestAuth::require(&state, &headers)?;
    require_csrf(&headers)?;
    let cloud = state.cloud(Some(auth.require_api_key()?));

    let draft = parse_draft(&body)?;
    // A node list outage still allows a manual node id
    let nodes = cloud.available_nodes().await.unwrap_or_else(|e| {
        warn!(error = %e, "Node list unavailable, skipping node checks");
        Vec::new()
    });
    draft.validate(draft.selected_node(&nodes))?;

    let provisioned = cloud.provision(&draft.provision_request()).await?;
    info!(name = %draft.name.trim(), app_id = ?provisioned.app_id, "Deployment provisioned");
    Ok(Json(provisioned))
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeQuery {
    #[serde(default)]
    pub ports: String,
}

/// GET /api/deploy/compose?ports=80,443
///
/// Compose file exposing the valid ports; falls back to port 80.
pub async fn compose(Query(query): Query<ComposeQuery>) -> Json<Value> {
    let ports = parse_ports(&query.ports);
    let open_ports = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
    Json(json!({
        "open_ports": open_ports,
        "docker_compose": build_compose_template(&ports),
    }))
}
