//! Trust center status summary.

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use nexis_common::json::{first_present, first_str, path, trimmed_str, Object};
use nexis_common::ServiceClient;

use super::metrics::Outcome;
use crate::server::AppState;

pub const TRUST_NOT_CONFIGURED: &str = "Trust center service is not configured.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustService {
    pub name: String,
    pub status: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustIncident {
    pub id: String,
    pub name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustSummary {
    pub overall_status: Option<String>,
    pub updated_at: Option<String>,
    pub services: Vec<TrustService>,
    pub incidents: Vec<TrustIncident>,
}

fn normalize_service(obj: &Object) -> TrustService {
    TrustService {
        name: first_str(obj, &["name", "component_name", "service"]).unwrap_or_else(|| "Service".to_string()),
        status: first_str(obj, &["status", "state", "health", "status_indicator"])
            .unwrap_or_else(|| "unknown".to_string()),
        description: first_str(obj, &["description", "details", "message"]),
    }
}

fn normalize_incident(obj: &Object) -> TrustIncident {
    TrustIncident {
        id: first_str(obj, &["id", "incident_id"]).unwrap_or_else(|| "incident".to_string()),
        name: first_str(obj, &["name", "title", "summary"]).unwrap_or_else(|| "Incident".to_string()),
        status: first_str(obj, &["status", "state"]).unwrap_or_else(|| "unknown".to_string()),
        started_at: first_str(obj, &["startedAt", "started_at", "started"]),
        resolved_at: first_str(obj, &["resolvedAt", "resolved_at", "resolved"]),
    }
}

/// First candidate that is an array, mapped over its object entries.
fn first_array<'a, T>(candidates: &[Option<&'a Value>], normalize: fn(&Object) -> T) -> Vec<T> {
    candidates
        .iter()
        .flatten()
        .find_map(|v| v.as_array())
        .map(|items| items.iter().filter_map(Value::as_object).map(normalize).collect())
        .unwrap_or_default()
}

pub fn trust_summary(data: &Value) -> Outcome<TrustSummary> {
    let obj = data.as_object().ok_or("Trust center data is unavailable.")?;
    let overall_status = first_present(obj, &["status", "state", "overall_status"])
        .or_else(|| path(data, &["page", "status"]))
        .and_then(trimmed_str);
    let services = first_array(
        &[
            obj.get("services"),
            obj.get("components"),
            obj.get("monitors"),
            path(data, &["status", "services"]),
            path(data, &["page", "services"]),
        ],
        normalize_service,
    );
    let incidents = first_array(
        &[
            obj.get("incidents"),
            obj.get("active_incidents"),
            obj.get("events"),
            path(data, &["page", "incidents"]),
        ],
        normalize_incident,
    );
    Ok(TrustSummary {
        overall_status,
        updated_at: first_str(obj, &["updatedAt", "updated_at", "last_updated"]),
        services,
        incidents,
    })
}

pub async fn fetch_trust_summary(state: &AppState) -> Outcome<TrustSummary> {
    let base = state
        .config
        .trust_center_api_url
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .ok_or(TRUST_NOT_CONFIGURED)?;
    let client = ServiceClient::new(state.http.clone(), base);
    let data = client
        .fetch_first_json(&["status", "summary", "health", ""], "Trust center unavailable.")
        .await?;
    trust_summary(&data)
}

/// GET /api/trust
pub async fn trust(State(state): State<Arc<AppState>>) -> Json<Value> {
    match fetch_trust_summary(&state).await {
        Ok(summary) => Json(json!({ "summary": summary, "error": null })),
        Err(error) => Json(json!({ "summary": null, "error": error })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statuspage_shape() {
        let data = json!({
            "page": {"status": "operational", "services": [{"component_name": "API", "state": "up"}]},
            "active_incidents": [{"title": "Slow deploys", "started_at": "2025-02-01"}],
            "last_updated": "2025-02-02"
        });
        let summary = trust_summary(&data).unwrap();
        assert_eq!(summary.overall_status.as_deref(), Some("operational"));
        assert_eq!(summary.services[0].name, "API");
        assert_eq!(summary.services[0].status, "up");
        assert_eq!(summary.incidents[0].id, "incident");
        assert_eq!(summary.incidents[0].name, "Slow deploys");
        assert_eq!(summary.incidents[0].status, "unknown");
        assert_eq!(summary.updated_at.as_deref(), Some("2025-02-02"));
    }

    #[test]
    fn test_object_status_is_not_overall_status() {
        let data = json!({"status": {"services": [{"name": "KMS", "health": "degraded"}]}});
        let summary = trust_summary(&data).unwrap();
        assert!(summary.overall_status.is_none());
        assert_eq!(summary.services[0].status, "degraded");
        assert!(summary.incidents.is_empty());
    }

    #[test]
    fn test_non_object_payload() {
        assert_eq!(trust_summary(&json!("ok")).unwrap_err(), "Trust center data is unavailable.");
    }
}
