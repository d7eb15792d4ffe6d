//! Adapters over the optional upstream services.
//!
//! Each adapter tries candidate paths and field names, then normalises what
//! it finds into the view types the dashboard renders.

pub mod agents;
pub mod api_keys;
pub mod chat;
pub mod deploy;
pub mod knowledge;
pub mod metrics;
pub mod profile;
pub mod teams;
pub mod templates;
pub mod trust;

use axum::http::HeaderMap;

use nexis_common::ServiceClient;

use crate::auth::{identity_headers, resolve_identity, Identity, SessionCookies};
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Authenticated caller of an adapter route
#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub identity: Identity,
    pub api_key: Option<String>,
}

impl RequestAuth {
    /// 401 `Unauthorized` without a session.
    pub fn require(state: &AppState, headers: &HeaderMap) -> ApiResult<Self> {
        let cookies = SessionCookies::from_headers(headers);
        let identity = resolve_identity(state, &cookies).ok_or_else(ApiError::unauthorized)?;
        Ok(Self {
            identity,
            api_key: cookies.api_key,
        })
    }

    /// 401 `API key required` when the session has no cloud key.
    pub fn require_api_key(&self) -> ApiResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("API key required".to_string()))
    }

    /// Client for `base_url` carrying identity headers and the API key.
    pub fn client(&self, state: &AppState, base_url: &str) -> ServiceClient {
        identity_headers(Some(&self.identity))
            .into_iter()
            .fold(ServiceClient::new(state.http.clone(), base_url), |client, (name, value)| {
                client.with_header(name, &value)
            })
            .with_api_key(self.api_key.as_deref())
    }
}

/// Configured base URL or `<Service> service is not configured`.
pub fn require_base<'a>(base_url: &'a Option<String>, service: &str) -> ApiResult<&'a str> {
    base_url
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| ApiError::service_not_configured(service))
}
