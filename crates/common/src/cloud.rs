//! Client for the Nexis cloud API.

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::cvm::{normalize_cvm_id, CvmAction, CvmDetail, CvmPage, CvmStatus, VisibilityUpdate};
use crate::deploy::{
    flatten_instance_types, CommitRequest, CommitResponse, InstanceType, InstanceTypesResponse,
    ProvisionRequest, ProvisionResponse, TeepodNode, TeepodsResponse,
};
use crate::state_stream::{state_events, StateEvent, StateSource};
use crate::upstream::{FetchResult, ServiceClient};
use crate::{Error, Result};

pub const DEFAULT_CLOUD_API_URL: &str = "https://cloud-api.nexis.network/api/v1";
pub const DEFAULT_CLOUD_API_VERSION: &str = "2025-10-28";
pub const VERSION_HEADER: &str = "X-Phala-Version";
pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Cloud API client, optionally bound to an API key
#[derive(Clone)]
pub struct CloudClient {
    http: Client,
    base_url: String,
    version: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_http(Client::new(), base_url, version)
    }

    pub fn with_http(http: Client, base_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            version: version.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn service(&self) -> ServiceClient {
        ServiceClient::new(self.http.clone(), &self.base_url)
            .with_header(VERSION_HEADER, &self.version)
            .with_api_key(self.api_key.as_deref())
    }

    /// Raw request; the caller decides what a failure means.
    pub async fn fetch(&self, method: Method, path: &str, body: Option<&Value>) -> Result<FetchResult> {
        self.service().fetch(method, path, body).await
    }

    async fn json<T: Serialize>(&self, method: Method, path: &str, body: Option<&T>) -> Result<Value> {
        let body = body.map(serde_json::to_value).transpose()?;
        let result = self.fetch(method, path, body.as_ref()).await?;
        debug!(path, status = result.status, "Cloud API response");
        result.into_result()
    }

    /// `GET /auth/me` with the bound key
    pub async fn me(&self) -> Result<FetchResult> {
        self.fetch(Method::GET, "/auth/me", None).await
    }

    pub async fn device_code(&self, client_id: &str, scope: &str) -> Result<FetchResult> {
        let body = json!({ "client_id": client_id, "scope": scope });
        self.fetch(Method::POST, "/auth/device/code", Some(&body)).await
    }

    pub async fn device_token(&self, device_code: &str) -> Result<FetchResult> {
        let body = json!({ "device_code": device_code, "grant_type": DEVICE_GRANT_TYPE });
        self.fetch(Method::POST, "/auth/device/token", Some(&body)).await
    }

    pub async fn list_cvms(&self, page: u64, page_size: u64) -> Result<CvmPage> {
        let path = format!("/cvms/paginated?page={page}&page_size={page_size}");
        let data = self.json::<Value>(Method::GET, &path, None).await?;
        Ok(CvmPage::from_value(&data, page, page_size))
    }

    pub async fn get_cvm(&self, id: &str) -> Result<CvmDetail> {
        let id = normalize_cvm_id(id);
        let path = format!("/cvms/{}", urlencoding::encode(&id));
        let data = self.json::<Value>(Method::GET, &path, None).await?;
        Ok(CvmDetail::from_value(&data, &id))
    }

    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse> {
        let data = self.json(Method::POST, "/cvms/provision", Some(request)).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn commit(&self, request: &CommitRequest) -> Result<CommitResponse> {
        let data = self.json(Method::POST, "/cvms", Some(request)).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn available_nodes(&self) -> Result<Vec<TeepodNode>> {
        let data = self.json::<Value>(Method::GET, "/teepods/available", None).await?;
        let parsed: TeepodsResponse = serde_json::from_value(data)?;
        Ok(parsed.nodes.unwrap_or_default())
    }

    pub async fn instance_types(&self) -> Result<Vec<InstanceType>> {
        let data = self.json::<Value>(Method::GET, "/instance-types", None).await?;
        let parsed: InstanceTypesResponse = serde_json::from_value(data)?;
        Ok(flatten_instance_types(parsed.result.unwrap_or_default()))
    }

    pub async fn cvm_action(&self, id: &str, action: CvmAction) -> Result<Value> {
        let path = format!("/cvms/{}/{}", urlencoding::encode(&normalize_cvm_id(id)), action.as_str());
        self.json::<Value>(Method::POST, &path, None).await
    }

    pub async fn delete_cvm(&self, id: &str) -> Result<Value> {
        let path = format!("/cvms/{}/delete", urlencoding::encode(&normalize_cvm_id(id)));
        self.json::<Value>(Method::DELETE, &path, None).await
    }

    pub async fn update_visibility(&self, id: &str, update: &VisibilityUpdate) -> Result<Value> {
        let path = format!("/cvms/{}/visibility", urlencoding::encode(&normalize_cvm_id(id)));
        self.json(Method::PATCH, &path, Some(update)).await
    }

    /// `GET /cvms/{id}/logs`; JSON or plain text depending on the upstream.
    pub async fn cvm_logs(&self, id: &str) -> Result<FetchResult> {
        let path = format!("/cvms/{}/logs", urlencoding::encode(&normalize_cvm_id(id)));
        self.fetch(Method::GET, &path, None).await
    }

    pub async fn cvm_stats(&self, id: &str) -> Result<FetchResult> {
        let path = format!("/cvms/{}/stats", urlencoding::encode(&normalize_cvm_id(id)));
        self.fetch(Method::GET, &path, None).await
    }

    /// Open `GET /cvms/{id}/state?target=` as an event stream.
    pub async fn state_stream(&self, id: &str, target: CvmStatus) -> Result<BoxStream<'static, Result<StateEvent>>> {
        let service = self.service();
        let url = service.url(&format!(
            "/cvms/{}/state?target={}",
            urlencoding::encode(&normalize_cvm_id(id)),
            target
        ));
        let response = service
            .http()
            .get(url)
            .headers(service.headers().clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            let result = FetchResult::from_response(response).await?;
            return Err(Error::upstream(result.status, result.error_message()));
        }
        Ok(state_events(response.bytes_stream()))
    }
}

#[async_trait]
impl StateSource for CloudClient {
    async fn open(&self, app_id: &str, target: CvmStatus) -> Result<BoxStream<'static, Result<StateEvent>>> {
        self.state_stream(app_id, target).await
    }
}
