//! Billing, agent and usage summaries for the dashboard.
//!
//! These endpoints never fail hard: every result is reported as
//! `{<payload>, error}` with status 200 so a page can render what it has.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use nexis_common::cloud::VERSION_HEADER;
use nexis_common::json::{extract_list, first_present, first_str, pick_number, pick_string, to_number, Object};
use nexis_common::ServiceClient;

use super::RequestAuth;
use crate::error::ApiResult;
use crate::server::AppState;
use crate::store::now_iso;

pub const BILLING_NOT_CONFIGURED: &str = "Billing service is not configured.";
pub const AGENTS_NOT_CONFIGURED: &str = "Agents service is not configured.";
pub const USAGE_NOT_CONFIGURED: &str = "Usage service is not configured.";

const DEFAULT_ERROR: &str = "Service unavailable.";

pub type Outcome<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSummary {
    pub monthly_cost: Option<f64>,
    pub currency: Option<String>,
    pub balance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePoint {
    pub date: String,
    pub cost: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub issued_at: Option<String>,
    pub due_at: Option<String>,
    pub pdf_url: Option<String>,
    pub hosted_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsSummary {
    pub active_agents: Option<f64>,
    pub total_agents: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUsageSummary {
    pub request_count: Option<f64>,
    pub error_count: Option<f64>,
    pub tokens_used: Option<f64>,
    pub period_label: Option<String>,
}

// ============================================================================
// Normalisation
// ============================================================================

pub fn billing_summary(data: &Value) -> Outcome<BillingSummary> {
    let obj = data.as_object().ok_or("Billing data is unavailable.")?;
    let summary = BillingSummary {
        monthly_cost: pick_number(
            obj,
            &["monthly_cost", "month_to_date_cost", "month_to_date", "monthly_total", "period_spend"],
        ),
        currency: pick_string(obj, &["currency", "billing_currency", "unit", "symbol"]),
        balance: pick_number(obj, &["balance", "credits", "credit_balance", "available_credits"]),
    };
    if summary.monthly_cost.is_none() && summary.balance.is_none() {
        return Err("Billing data format not recognized.".to_string());
    }
    Ok(summary)
}

pub fn usage_series(data: &Value) -> Outcome<Vec<UsagePoint>> {
    let items = match data {
        Value::Array(items) => Some(items),
        Value::Object(obj) => {
            first_present(obj, &["items", "data", "series", "usage", "history"]).and_then(Value::as_array)
        }
        _ => return Err("Usage series data is unavailable.".to_string()),
    };
    let series: Vec<UsagePoint> = items
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .map(|obj| UsagePoint {
            date: pick_string(obj, &["date", "day", "timestamp", "time", "period"]).unwrap_or_else(now_iso),
            cost: pick_number(obj, &["cost", "amount", "spend", "value", "total"]),
            currency: pick_string(obj, &["currency", "unit", "symbol"]),
        })
        .collect();
    if series.is_empty() {
        return Err("Usage series format not recognized.".to_string());
    }
    Ok(series)
}

fn normalize_invoice(obj: &Object) -> Option<Invoice> {
    let text = |keys: &[&str]| first_str(obj, keys);
    Some(Invoice {
        id: text(&["id", "invoice_id", "number"])?,
        amount: first_present(obj, &["amount", "total", "balance_due"]).and_then(to_number),
        currency: text(&["currency", "unit"]),
        status: text(&["status", "state"]),
        issued_at: text(&["issuedAt", "issued_at", "created_at", "created"]),
        due_at: text(&["dueAt", "due_at", "due_date"]),
        pdf_url: text(&["pdf_url", "invoice_pdf", "pdf"]),
        hosted_url: text(&["hosted_invoice_url", "url", "invoice_url"]),
    })
}

pub fn invoices(data: &Value) -> Vec<Invoice> {
    extract_list(data, &["items", "data", "invoices", "results"])
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(normalize_invoice)
                .collect()
        })
        .unwrap_or_default()
}

pub fn agents_summary(data: &Value) -> Outcome<AgentsSummary> {
    let total_from_list = match data {
        Value::Array(items) => Some(items.len() as f64),
        Value::Object(_) => extract_list(data, &["items", "data", "agents"]).map(|items| items.len() as f64),
        _ => return Err("Agents data is unavailable.".to_string()),
    };
    let (total, active) = match data.as_object() {
        Some(obj) => {
            let total = total_from_list.or_else(|| pick_number(obj, &["total", "count", "total_agents", "agents_count"]));
            let active = pick_number(obj, &["active", "active_agents", "running", "running_agents"]).or(total);
            (total, active)
        }
        None => (total_from_list, total_from_list),
    };
    if total.is_none() && active.is_none() {
        return Err("Agents data format not recognized.".to_string());
    }
    Ok(AgentsSummary {
        active_agents: active,
        total_agents: total,
    })
}

pub fn api_usage_summary(data: &Value) -> Outcome<ApiUsageSummary> {
    let obj = data.as_object().ok_or("Usage data is unavailable.")?;
    let source = ["usage", "stats", "summary", "data", "metrics"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_object))
        .unwrap_or(obj);
    let summary = ApiUsageSummary {
        request_count: pick_number(
            source,
            &["requests", "request_count", "total_requests", "requests_total", "count"],
        ),
        error_count: pick_number(
            source,
            &["errors", "error_count", "failed_requests", "errors_total", "failed_total"],
        ),
        tokens_used: pick_number(
            source,
            &["tokens", "token_count", "tokens_used", "tokens_total", "total_tokens"],
        ),
        period_label: pick_string(source, &["period", "window", "interval", "label"]),
    };
    if summary.request_count.is_none() && summary.error_count.is_none() && summary.tokens_used.is_none() {
        return Err("Usage data format not recognized.".to_string());
    }
    Ok(summary)
}

// ============================================================================
// Fetchers
// ============================================================================

fn service(state: &AppState, base: &Option<String>, api_key: Option<&str>) -> Option<ServiceClient> {
    base.as_deref()
        .filter(|b| !b.trim().is_empty())
        .map(|b| ServiceClient::new(state.http.clone(), b).with_api_key(api_key))
}

pub async fn fetch_billing_summary(state: &AppState, api_key: Option<&str>) -> Outcome<BillingSummary> {
    let client = service(state, &state.config.billing_api_url, api_key).ok_or(BILLING_NOT_CONFIGURED)?;
    let data = client.fetch_first_json(&["summary", "stats", ""], DEFAULT_ERROR).await?;
    billing_summary(&data)
}

pub async fn fetch_usage_series(state: &AppState, api_key: Option<&str>) -> Outcome<Vec<UsagePoint>> {
    let client = service(state, &state.config.billing_api_url, api_key).ok_or(BILLING_NOT_CONFIGURED)?;
    let data = client
        .fetch_first_json(&["usage", "costs", "spend", "history", "timeseries", ""], DEFAULT_ERROR)
        .await?;
    usage_series(&data)
}

pub async fn fetch_invoices(state: &AppState, api_key: Option<&str>) -> Outcome<Vec<Invoice>> {
    let client = service(state, &state.config.billing_api_url, api_key).ok_or(BILLING_NOT_CONFIGURED)?;
    let data = client
        .fetch_first_json(&["invoices", "history", "billing/invoices", ""], "Unable to load invoices.")
        .await?;
    Ok(invoices(&data))
}

pub async fn fetch_agents_summary(state: &AppState, api_key: Option<&str>) -> Outcome<AgentsSummary> {
    let client = service(state, &state.config.agents_api_url, api_key).ok_or(AGENTS_NOT_CONFIGURED)?;
    let data = client.fetch_first_json(&["summary", "stats", ""], DEFAULT_ERROR).await?;
    agents_summary(&data)
}

/// Usage from the dedicated service, or the cloud API with its version header.
pub async fn fetch_api_usage(state: &AppState, api_key: Option<&str>) -> Outcome<ApiUsageSummary> {
    let client = match service(state, &state.config.usage_api_url, api_key) {
        Some(client) => client,
        None if !state.config.cloud_api_url.trim().is_empty() => {
            ServiceClient::new(state.http.clone(), state.config.cloud_api_url.as_str())
                .with_header(VERSION_HEADER, &state.config.cloud_api_version)
                .with_api_key(api_key)
        }
        None => return Err(USAGE_NOT_CONFIGURED.to_string()),
    };
    let paths = [
        "account/usage",
        "account/stats",
        "usage",
        "stats",
        "users/me/usage",
        "users/me",
        "",
    ];
    let data = client.fetch_first_json(&paths, DEFAULT_ERROR).await?;
    api_usage_summary(&data)
}

fn report<T: Serialize>(field: &str, outcome: Outcome<T>, empty: Value) -> Json<Value> {
    let (payload, error) = match outcome {
        Ok(value) => (json!(value), Value::Null),
        Err(message) => (empty, Value::String(message)),
    };
    let mut body = serde_json::Map::new();
    body.insert(field.to_string(), payload);
    body.insert("error".to_string(), error);
    Json(Value::Object(body))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/metrics/billing
pub async fn billing(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let outcome = fetch_billing_summary(&state, auth.api_key.as_deref()).await;
    Ok(report("summary", outcome, Value::Null))
}

/// GET /api/metrics/billing/usage
pub async fn billing_usage(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let outcome = fetch_usage_series(&state, auth.api_key.as_deref()).await;
    Ok(report("series", outcome, json!([])))
}

/// GET /api/metrics/billing/invoices
pub async fn billing_invoices(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let outcome = fetch_invoices(&state, auth.api_key.as_deref()).await;
    Ok(report("items", outcome, json!([])))
}

/// GET /api/metrics/agents
pub async fn agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let outcome = fetch_agents_summary(&state, auth.api_key.as_deref()).await;
    Ok(report("summary", outcome, Value::Null))
}

/// GET /api/usage
pub async fn usage(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let auth = RequestAuth::require(&state, &headers)?;
    let api_key = auth.require_api_key()?;
    let outcome = fetch_api_usage(&state, Some(api_key)).await;
    Ok(report("summary", outcome, Value::Null))
}
