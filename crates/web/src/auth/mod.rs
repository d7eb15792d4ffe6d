//! Browser session authentication.
//!
//! A session is either an opaque cloud API key or a verified Privy identity
//! token, each held in its own HttpOnly cookie. Mutating requests carry a
//! double-submit CSRF token.

pub mod csrf;
pub mod privy;
pub mod routes;

use axum::http::{header::SET_COOKIE, HeaderMap, HeaderName};
use axum::response::AppendHeaders;
use axum_extra::extract::CookieJar;
use serde::Serialize;
use tracing::debug;

use nexis_common::secrets::api_key_fingerprint;

use crate::server::AppState;

pub use csrf::require_csrf;
pub use privy::{PrivyAdmin, PrivyClaims, PrivyVerifier};

pub const API_KEY_COOKIE: &str = "nexis_api_key";
pub const PRIVY_COOKIE: &str = "nexis_privy_token";
pub const CSRF_COOKIE: &str = "nexis_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_MAX_AGE: u64 = 60 * 60 * 4;

pub const USER_ID_HEADER: &str = "X-Nexis-User-Id";
pub const AUTH_METHOD_HEADER: &str = "X-Nexis-Auth-Method";

/// Cookie values relevant to the session, empty values dropped
#[derive(Debug, Clone, Default)]
pub struct SessionCookies {
    pub api_key: Option<String>,
    pub privy_token: Option<String>,
    pub csrf: Option<String>,
}

impl SessionCookies {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let jar = CookieJar::from_headers(headers);
        let get = |name: &str| {
            jar.get(name)
                .map(|c| c.value().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            api_key: get(API_KEY_COOKIE),
            privy_token: get(PRIVY_COOKIE),
            csrf: get(CSRF_COOKIE),
        }
    }
}

/// Attributes applied to every cookie the console sets
#[derive(Debug, Clone, Copy)]
pub struct CookiePolicy {
    pub max_age: u64,
    pub secure: bool,
}

impl CookiePolicy {
    fn render(&self, name: &str, value: &str, http_only: bool, max_age: u64) -> String {
        let mut cookie = format!("{name}={value}; Path=/; SameSite=Lax; Max-Age={max_age}");
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// HttpOnly session cookie
    pub fn session(&self, name: &str, value: &str) -> String {
        self.render(name, value, true, self.max_age)
    }

    pub fn clear(&self, name: &str) -> String {
        self.render(name, "", true, 0)
    }

    /// CSRF cookie; readable by page scripts
    pub fn csrf(&self, token: &str) -> String {
        self.render(CSRF_COOKIE, token, false, CSRF_MAX_AGE)
    }
}

pub type SetCookies = AppendHeaders<Vec<(HeaderName, String)>>;

pub fn set_cookies(cookies: Vec<String>) -> SetCookies {
    AppendHeaders(cookies.into_iter().map(|c| (SET_COOKIE, c)).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthMethod {
    #[serde(rename = "privy")]
    Privy,
    #[serde(rename = "api-key")]
    ApiKey,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Privy => "privy",
            AuthMethod::ApiKey => "api-key",
        }
    }
}

/// Who is making the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub method: AuthMethod,
}

/// Resolve the caller. A Privy token that fails verification falls back to
/// the API-key cookie.
pub fn resolve_identity(state: &AppState, cookies: &SessionCookies) -> Option<Identity> {
    if let (Some(token), Some(verifier)) = (cookies.privy_token.as_deref(), state.privy.as_ref()) {
        match verifier.verify(token) {
            Ok(claims) => {
                return Some(Identity {
                    id: claims.user_id,
                    method: AuthMethod::Privy,
                })
            }
            Err(e) => debug!(error = %e, "Ignoring unverifiable Privy cookie"),
        }
    }
    cookies.api_key.as_deref().map(|key| Identity {
        id: api_key_fingerprint(key),
        method: AuthMethod::ApiKey,
    })
}

/// Headers that tell an upstream service who the caller is
pub fn identity_headers(identity: Option<&Identity>) -> Vec<(&'static str, String)> {
    match identity {
        Some(identity) => vec![
            (USER_ID_HEADER, identity.id.clone()),
            (AUTH_METHOD_HEADER, identity.method.as_str().to_string()),
        ],
        None => Vec::new(),
    }
}

/// `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
