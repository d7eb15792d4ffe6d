//! HTTP error responses
//!
//! Every failure renders as `{"error": "...", ...extra}` JSON.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// API error taxonomy
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("Invalid CSRF token")]
    Csrf,

    #[error("{0}")]
    Forbidden(String),

    /// Named service has no base URL configured
    #[error("{0}")]
    NotConfigured(String),

    /// Upstream failed; `status` is passed through (502 when unknown)
    #[error("{message}")]
    Upstream {
        status: StatusCode,
        message: String,
        extra: Option<Map<String, Value>>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        ApiError::Unauthorized("Unauthorized".to_string())
    }

    pub fn not_authenticated() -> Self {
        ApiError::Unauthorized("Not authenticated".to_string())
    }

    /// `"<Service> service is not configured"`
    pub fn service_not_configured(service: &str) -> Self {
        ApiError::NotConfigured(format!("{service} service is not configured"))
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::upstream(StatusCode::BAD_GATEWAY, message)
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError::Upstream {
            status,
            message: message.into(),
            extra: None,
        }
    }

    /// Upstream status given as a number; invalid codes become 502.
    pub fn upstream_code(status: u16, message: impl Into<String>) -> Self {
        Self::upstream(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            message,
        )
    }

    /// Attach an extra top-level field to the body, keeping the status.
    pub fn with_extra(self, key: &str, value: Value) -> Self {
        let status = self.status();
        let (message, extra) = match self {
            ApiError::Upstream { message, extra, .. } => (message, extra),
            other => (other.to_string(), None),
        };
        let mut extra = extra.unwrap_or_default();
        extra.insert(key.to_string(), value);
        ApiError::Upstream {
            status,
            message,
            extra: Some(extra),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Csrf | ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Upstream { status, .. } => *status,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.to_string()));
        if let ApiError::Upstream {
            extra: Some(extra), ..
        } = self
        {
            for (k, v) in extra {
                body.insert(k.clone(), v.clone());
            }
        }
        Value::Object(body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<nexis_common::Error> for ApiError {
    fn from(err: nexis_common::Error) -> Self {
        use nexis_common::Error as E;
        match err {
            E::Validation(msg) => ApiError::Validation(msg),
            E::NotFound { kind, id } => ApiError::NotFound(format!("{kind} {id} not found")),
            E::NotConfigured(service) => ApiError::service_not_configured(&service),
            E::Upstream { status, message } => ApiError::upstream_code(status, message),
            E::Http(e) => ApiError::bad_gateway(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// `{"error": message}` with an arbitrary status, for pass-through cases.
pub fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::unauthorized().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Csrf.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::service_not_configured("Teams").status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(ApiError::bad_gateway("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::upstream_code(42, "x").status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_body_shapes() {
        assert_eq!(ApiError::Csrf.body(), json!({"error": "Invalid CSRF token"}));
        assert_eq!(
            ApiError::service_not_configured("Teams").body(),
            json!({"error": "Teams service is not configured"})
        );
        let err = ApiError::upstream(StatusCode::UNAUTHORIZED, "Invalid API key")
            .with_extra("detail", json!({"message": "expired"}));
        assert_eq!(
            err.body(),
            json!({"error": "Invalid API key", "detail": {"message": "expired"}})
        );
        let err = ApiError::validation("Invalid key/value lines").with_extra("invalid", json!(["env: x"]));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body()["invalid"][0], "env: x");
    }

    #[test]
    fn test_from_common_error() {
        let err: ApiError = nexis_common::Error::validation("Provision resources before deploying.").into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err: ApiError = nexis_common::Error::upstream(404, "gone").into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
