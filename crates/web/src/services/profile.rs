//! Profile metadata stored on the Privy user.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::auth::{require_csrf, PrivyAdmin, SessionCookies};
use crate::error::{ApiError, ApiResult};
use crate::server::{read_json, AppState};

pub const MAX_DISPLAY_NAME: usize = 80;
pub const MAX_AVATAR_URL: usize = 320;

/// Trimmed profile fields from the request body; non-strings are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileInput {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileInput {
    pub fn from_json(body: &Value) -> Self {
        let field = |key: &str| body.get(key).and_then(Value::as_str).map(|s| s.trim().to_string());
        Self {
            display_name: field("displayName"),
            avatar_url: field("avatarUrl"),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(name) = &self.display_name {
            if name.chars().count() > MAX_DISPLAY_NAME {
                return Err("Display name is too long.");
            }
        }
        let Some(avatar) = self.avatar_url.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(());
        };
        if avatar.chars().count() > MAX_AVATAR_URL {
            return Err("Avatar URL is too long.");
        }
        match url::Url::parse(avatar) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            Ok(_) => Err("Avatar URL must start with http or https."),
            Err(_) => Err("Avatar URL must be a valid URL."),
        }
    }

    /// `custom_metadata` with the given fields overwritten.
    pub fn merge_into(&self, mut metadata: Map<String, Value>) -> Map<String, Value> {
        if let Some(name) = &self.display_name {
            metadata.insert("display_name".to_string(), Value::String(name.clone()));
        }
        if let Some(avatar) = &self.avatar_url {
            metadata.insert("avatar_url".to_string(), Value::String(avatar.clone()));
        }
        metadata
    }
}

fn custom_metadata(user: &Value) -> Map<String, Value> {
    user.get("custom_metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn admin(state: &AppState) -> ApiResult<&PrivyAdmin> {
    state
        .privy_admin
        .as_ref()
        .ok_or_else(|| ApiError::NotConfigured("Privy admin client not configured".to_string()))
}

/// Privy user id from a verified identity cookie.
fn privy_user(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    let cookies = SessionCookies::from_headers(headers);
    let (Some(token), Some(verifier)) = (cookies.privy_token, state.privy.as_ref()) else {
        return Err(ApiError::not_authenticated());
    };
    verifier
        .verify(&token)
        .map(|claims| claims.user_id)
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// The signed-in Privy user record.
pub async fn current_user(state: &AppState, headers: &HeaderMap) -> ApiResult<Value> {
    let admin = admin(state)?;
    let user_id = privy_user(state, headers)?;
    admin
        .get_user(&user_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub const DEFAULT_DISPLAY_NAME: &str = "Nexis Console User";

/// What the settings page shows for a user record
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSummary {
    pub display_name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    /// Display name from metadata, else the linked email, else a default.
    pub fn from_user(user: &Value) -> Self {
        let metadata = custom_metadata(user);
        let meta = |key: &str| {
            metadata
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let email = user
            .get("linked_accounts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|account| account.get("type").and_then(Value::as_str) == Some("email"))
            .find_map(|account| account.get("address").and_then(Value::as_str))
            .map(str::to_string);
        Self {
            display_name: meta("display_name")
                .or_else(|| email.clone())
                .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
            email,
            avatar_url: meta("avatar_url"),
        }
    }
}

/// GET /api/profile
pub async fn get_profile(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(json!({ "customMetadata": custom_metadata(&user) })))
}

/// POST /api/profile `{displayName?, avatarUrl?}`
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    require_csrf(&headers)?;
    let admin = admin(&state)?;
    let user_id = privy_user(&state, &headers)?;

    let input = ProfileInput::from_json(&read_json(&body));
    input.validate().map_err(ApiError::validation)?;

    let user = admin
        .get_user(&user_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let metadata = input.merge_into(custom_metadata(&user));
    let updated = admin
        .set_custom_metadata(&user_id, &metadata)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!(user_id = %user_id, "Profile updated");

    let saved = updated
        .get("custom_metadata")
        .filter(|m| m.is_object())
        .cloned()
        .unwrap_or(Value::Object(metadata));
    Ok(Json(json!({ "customMetadata": saved })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_summary() {
        let user = json!({
            "linked_accounts": [{"type": "wallet", "address": "0xabc"}, {"type": "email", "address": "a@b.co"}],
            "custom_metadata": {"display_name": " Ada ", "avatar_url": "https://img.example/a.png"}
        });
        let summary = ProfileSummary::from_user(&user);
        assert_eq!(summary.display_name, "Ada");
        assert_eq!(summary.email.as_deref(), Some("a@b.co"));
        assert_eq!(summary.avatar_url.as_deref(), Some("https://img.example/a.png"));

        let email_only = ProfileSummary::from_user(&json!({"linked_accounts": [{"type": "email", "address": "a@b.co"}]}));
        assert_eq!(email_only.display_name, "a@b.co");
        assert_eq!(ProfileSummary::from_user(&json!({})).display_name, DEFAULT_DISPLAY_NAME);
    }

    #[test]
    fn test_validation_messages() {
        let long_name = ProfileInput {
            display_name: Some("x".repeat(81)),
            avatar_url: None,
        };
        assert_eq!(long_name.validate(), Err("Display name is too long."));

        let ftp = ProfileInput {
            display_name: None,
            avatar_url: Some("ftp://host/a.png".into()),
        };
        assert_eq!(ftp.validate(), Err("Avatar URL must start with http or https."));

        let junk = ProfileInput {
            display_name: None,
            avatar_url: Some("not a url".into()),
        };
        assert_eq!(junk.validate(), Err("Avatar URL must be a valid URL."));

        let long_url = ProfileInput {
            display_name: None,
            avatar_url: Some(format!("https://x/{}", "a".repeat(320))),
        };
        assert_eq!(long_url.validate(), Err("Avatar URL is too long."));

        let ok = ProfileInput::from_json(&json!({"displayName": " Ada ", "avatarUrl": "https://img/a.png"}));
        assert_eq!(ok.display_name.as_deref(), Some("Ada"));
        assert!(ok.validate().is_ok());
        assert!(ProfileInput::from_json(&json!({"avatarUrl": ""})).validate().is_ok());
    }

    #[test]
    fn test_merge_keeps_other_metadata() {
        let mut existing = Map::new();
        existing.insert("plan".into(), json!("pro"));
        existing.insert("display_name".into(), json!("Old"));
        let input = ProfileInput {
            display_name: Some("New".into()),
            avatar_url: None,
        };
        let merged = input.merge_into(existing);
        assert_eq!(merged["plan"], "pro");
        assert_eq!(merged["display_name"], "New");
        assert!(merged.get("avatar_url").is_none());
    }
}
