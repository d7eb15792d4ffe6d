//! Pass-through proxy to upstream REST services.
//!
//! The request method, query string and body go upstream unchanged along with
//! the session's API key. The upstream body is streamed back, so server-sent
//! event endpoints such as `/cvms/{id}/state` work through the proxy.

use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{FromRequest, Path, Request, State},
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderMap, Method,
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use nexis_common::cloud::VERSION_HEADER;
use nexis_common::upstream::join_url;
use nexis_common::CommitRequest;

use crate::auth::{require_csrf, SessionCookies};
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};

/// Largest request body forwarded upstream
pub const MAX_PROXY_BODY: usize = 16 * 1024 * 1024;

/// Buffered incoming request, ready to forward
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

#[async_trait]
impl<S> FromRequest<S> for ProxyRequest
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_PROXY_BODY)
            .await
            .map_err(|e| ApiError::validation(format!("Unable to read request body: {e}")).into_response())?;
        Ok(Self {
            method: parts.method,
            headers: parts.headers,
            query: parts.uri.query().map(str::to_string),
            body,
        })
    }
}

/// One upstream service mount
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    pub base_url: Option<String>,
    pub service_name: String,
    pub path_segments: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl ServiceProxy {
    pub fn new(service_name: &str, base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.filter(|b| !b.trim().is_empty()),
            service_name: service_name.to_string(),
            path_segments: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn segments<I, T>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.path_segments.extend(segments.into_iter().map(Into::into));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// `base` without trailing `/`, then `/seg/seg`, then `?query`.
    pub fn target_url(&self, query: Option<&str>) -> Option<String> {
        let base = self.base_url.as_deref()?.trim_end_matches('/');
        let mut url = base.to_string();
        if !self.path_segments.is_empty() {
            url.push('/');
            url.push_str(&self.path_segments.join("/"));
        }
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        Some(url)
    }

    pub async fn forward(&self, http: &reqwest::Client, request: ProxyRequest) -> ApiResult<Response> {
        let target = self
            .target_url(request.query.as_deref())
            .ok_or_else(|| ApiError::service_not_configured(&self.service_name))?;

        let reads_only = request.method == Method::GET || request.method == Method::HEAD;
        if !reads_only {
            require_csrf(&request.headers)?;
        }

        let mut upstream = http.request(request.method.clone(), &target);
        for (name, value) in &self.headers {
            upstream = upstream.header(name.as_str(), value.as_str());
        }
        for name in [CONTENT_TYPE, ACCEPT] {
            if let Some(value) = request.headers.get(&name) {
                upstream = upstream.header(name, value.clone());
            }
        }
        if let Some(api_key) = SessionCookies::from_headers(&request.headers).api_key {
            upstream = upstream.header("X-API-Key", api_key);
        }
        if !reads_only && !request.body.is_empty() {
            upstream = upstream.body(request.body);
        }

        debug!(service = %self.service_name, method = %request.method, "Proxying request");
        let response = upstream.send().await.map_err(|e| {
            warn!(service = %self.service_name, error = %e, "Upstream request failed");
            ApiError::bad_gateway(format!("{} service is unavailable", self.service_name))
        })?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let mut builder = Response::builder().status(status);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder
            .body(Body::from_stream(response.bytes_stream()))
            .map_err(|e| ApiError::internal(e.to_string()))
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Teams upstreams mounted at the service root need a `team` prefix.
pub fn needs_team_prefix(base_url: Option<&str>) -> bool {
    match base_url {
        None => true,
        Some(base) => {
            let normalized = base.trim_end_matches('/');
            !(normalized.ends_with("/team") || normalized.ends_with("/teams"))
        }
    }
}

// ============================================================================
// Mounted proxies
// ============================================================================

fn cvms_proxy(state: &AppState) -> ServiceProxy {
    ServiceProxy::new(
        "Nexis Cloud",
        Some(join_url(&state.config.cloud_api_url, "cvms")),
    )
    .header(VERSION_HEADER, state.config.cloud_api_version.clone())
}

/// Any method on `/api/cvms`. A POST here is a commit and must carry the
/// provision result.
pub async fn cvms_root(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    if request.method == Method::POST {
        require_csrf(&request.headers)?;
        CommitRequest::validate_json(&read_json(&request.body))?;
    }
    cvms_proxy(&state).forward(&state.http, request).await
}

pub async fn cvms_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: ProxyRequest,
) -> ApiResult<Response> {
    cvms_proxy(&state)
        .segments(split_path(&path))
        .forward(&state.http, request)
        .await
}

/// Read-only cloud helpers such as `teepods/available` and `instance-types`
pub async fn cloud_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: ProxyRequest,
) -> ApiResult<Response> {
    ServiceProxy::new("Nexis Cloud", Some(state.config.cloud_api_url.clone()))
        .header(VERSION_HEADER, state.config.cloud_api_version.clone())
        .segments(split_path(&path))
        .forward(&state.http, request)
        .await
}

pub async fn teams_root(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    ServiceProxy::new("Teams", state.config.teams_api_url.clone())
        .forward(&state.http, request)
        .await
}

pub async fn teams_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: ProxyRequest,
) -> ApiResult<Response> {
    ServiceProxy::new("Teams", state.config.teams_api_url.clone())
        .segments(split_path(&path))
        .forward(&state.http, request)
        .await
}

pub async fn billing_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: ProxyRequest,
) -> ApiResult<Response> {
    ServiceProxy::new("Billing", state.config.billing_api_url.clone())
        .segments(split_path(&path))
        .forward(&state.http, request)
        .await
}

/// Mutating methods on `/api/agents`; `GET` is served by the agents adapter.
pub async fn agents_mutate(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    ServiceProxy::new("Agents", state.config.agents_api_url.clone())
        .forward(&state.http, request)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        let proxy = ServiceProxy::new("Teams", Some("http://teams.local/api/".into()))
            .segments(["team", "members"]);
        assert_eq!(
            proxy.target_url(Some("page=2")).as_deref(),
            Some("http://teams.local/api/team/members?page=2")
        );
        let bare = ServiceProxy::new("Teams", Some("http://teams.local".into()));
        assert_eq!(bare.target_url(None).as_deref(), Some("http://teams.local"));
        assert_eq!(bare.target_url(Some("")).as_deref(), Some("http://teams.local"));
        assert!(ServiceProxy::new("Teams", Some("  ".into())).target_url(None).is_none());
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("app_1/state"), vec!["app_1", "state"]);
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
    }

    #[test]
    fn test_needs_team_prefix() {
        assert!(needs_team_prefix(None));
        assert!(needs_team_prefix(Some("http://svc.local/api")));
        assert!(!needs_team_prefix(Some("http://svc.local/api/teams/")));
        assert!(!needs_team_prefix(Some("http://svc.local/team")));
    }
}
