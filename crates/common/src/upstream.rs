//! HTTP access to upstream REST services.
//!
//! Two probing strategies are used against services whose paths are not
//! stable: [`ServiceClient::fetch_first`] stops at the first status that is
//! not 404/405, [`ServiceClient::fetch_first_json`] keeps going past any failure.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Join a base URL and a relative path with exactly one `/`.
pub fn join_url(base: &str, path: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    let cleaned = path.trim_start_matches('/');
    if cleaned.is_empty() {
        trimmed.to_string()
    } else {
        format!("{trimmed}/{cleaned}")
    }
}

/// Decoded upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub status: u16,
    pub ok: bool,
    /// JSON when the content type says so, text otherwise, null for 204.
    pub data: Value,
}

impl FetchResult {
    pub async fn from_response(response: Response) -> Result<Self> {
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));

        let data = if status == StatusCode::NO_CONTENT {
            Value::Null
        } else if is_json {
            response.json::<Value>().await?
        } else {
            Value::String(response.text().await?)
        };

        Ok(Self {
            status: status.as_u16(),
            ok: status.is_success(),
            data,
        })
    }

    /// Text body, else `Request failed (N)`.
    pub fn failure_text(&self) -> String {
        match &self.data {
            Value::String(text) => text.clone(),
            _ => format!("Request failed ({})", self.status),
        }
    }

    /// `error`/`detail` of a JSON body, the text body, else `Request failed with N`.
    pub fn error_message(&self) -> String {
        let fallback = || format!("Request failed with {}", self.status);
        match &self.data {
            Value::Object(obj) => ["error", "detail"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
                .map(str::to_string)
                .unwrap_or_else(fallback),
            Value::String(text) if !text.is_empty() => text.clone(),
            _ => fallback(),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(Error::upstream(self.status, self.error_message()))
        }
    }
}

/// One candidate request in a fallback list
#[derive(Debug, Clone)]
pub struct Candidate {
    pub method: Method,
    pub path: String,
}

impl Candidate {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
        }
    }

    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }
}

/// Client bound to one upstream base URL and a fixed header set
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: Client,
    base_url: String,
    headers: HeaderMap,
}

impl ServiceClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Add a header; invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => debug!(header = name, "Skipping invalid upstream header"),
        }
        self
    }

    /// Attach `X-API-Key` when a key is present.
    pub fn with_api_key(self, api_key: Option<&str>) -> Self {
        match api_key.filter(|k| !k.is_empty()) {
            Some(key) => self.with_header("X-API-Key", key),
            None => self,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Single request. Transport errors are `Err`; HTTP errors are in the result.
    pub async fn fetch(&self, method: Method, path: &str, body: Option<&Value>) -> Result<FetchResult> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        FetchResult::from_response(response).await
    }

    /// Try candidates in order. The first 2xx wins; 404/405 moves on; any
    /// other status stops with the response text or `Request failed (N)`.
    pub async fn fetch_first(&self, candidates: &[Candidate], body: Option<&Value>) -> Result<FetchResult> {
        let mut last_error: Option<Error> = None;
        for candidate in candidates {
            let result = self.fetch(candidate.method.clone(), &candidate.path, body).await?;
            if result.ok {
                return Ok(result);
            }
            if result.status != 404 && result.status != 405 {
                return Err(Error::upstream(result.status, result.failure_text()));
            }
            debug!(path = %candidate.path, status = result.status, "Upstream path not available");
            last_error = Some(Error::upstream(
                result.status,
                format!("Request failed ({})", result.status),
            ));
        }
        Err(last_error.unwrap_or_else(|| Error::upstream(502, "Service unavailable.")))
    }

    /// GET each path in order until one answers 2xx with JSON. Every failure
    /// is remembered; the last one (or `default_error`) is returned.
    pub async fn fetch_first_json(&self, paths: &[&str], default_error: &str) -> std::result::Result<Value, String> {
        let mut last_error = default_error.to_string();
        for path in paths {
            let response = match self
                .http
                .get(self.url(path))
                .headers(self.headers.clone())
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!(path, error = %e, "Upstream request failed");
                    last_error = e.to_string();
                    continue;
                }
            };
            if !response.status().is_success() {
                last_error = format!("Request failed ({})", response.status().as_u16());
                continue;
            }
            match response.json::<Value>().await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!(path, error = %e, "Upstream returned a non-JSON body");
                    last_error = e.to_string();
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://x/api/", "/configs"), "http://x/api/configs");
        assert_eq!(join_url("http://x/api", "configs"), "http://x/api/configs");
        assert_eq!(join_url("http://x/api/", ""), "http://x/api");
    }

    #[test]
    fn test_error_message_sources() {
        let json_err = FetchResult { status: 400, ok: false, data: json!({"detail": "bad"}) };
        assert_eq!(json_err.error_message(), "bad");
        let text = FetchResult { status: 500, ok: false, data: json!("boom") };
        assert_eq!(text.error_message(), "boom");
        assert_eq!(text.failure_text(), "boom");
        let empty = FetchResult { status: 503, ok: false, data: Value::Null };
        assert_eq!(empty.error_message(), "Request failed with 503");
        assert_eq!(empty.failure_text(), "Request failed (503)");
    }

    #[tokio::test]
    async fn test_fetch_decodes_by_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), server.uri());
        assert_eq!(client.fetch(Method::GET, "json", None).await.unwrap().data, json!({"a": 1}));
        assert_eq!(client.fetch(Method::GET, "text", None).await.unwrap().data, json!("plain"));
        let gone = client.fetch(Method::DELETE, "gone", None).await.unwrap();
        assert!(gone.ok);
        assert_eq!(gone.data, Value::Null);
    }

    #[tokio::test]
    async fn test_fetch_first_skips_404_and_stops_on_other_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .and(header("X-API-Key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c"))
            .respond_with(ResponseTemplate::new(500).set_body_string("exploded"))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), server.uri()).with_api_key(Some("k"));
        let found = client
            .fetch_first(&[Candidate::get("a"), Candidate::get("b")], None)
            .await
            .unwrap();
        assert_eq!(found.data, json!({"ok": true}));

        let err = client
            .fetch_first(&[Candidate::get("c"), Candidate::get("b")], None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "exploded");

        let err = client.fetch_first(&[Candidate::get("a")], None).await.unwrap_err();
        assert_eq!(err.to_string(), "Request failed (404)");
    }

    #[tokio::test]
    async fn test_fetch_first_json_keeps_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/summary"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 3})))
            .mount(&server)
            .await;

        let client = ServiceClient::new(Client::new(), format!("{}/", server.uri()));
        let data = client.fetch_first_json(&["summary", "stats"], "Service unavailable.").await.unwrap();
        assert_eq!(data, json!({"total": 3}));

        let err = client.fetch_first_json(&["summary"], "Service unavailable.").await.unwrap_err();
        assert_eq!(err, "Request failed (500)");
        let err = client.fetch_first_json(&[], "Service unavailable.").await.unwrap_err();
        assert_eq!(err, "Service unavailable.");
    }
}
