//! Console HTTP server: shared state and the router.

use axum::{
    body::Bytes,
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use nexis_common::{CloudClient, SecretBox};

use crate::auth::{self, CookiePolicy, PrivyAdmin, PrivyVerifier};
use crate::config::ConsoleConfig;
use crate::pages;
use crate::proxy;
use crate::services::{agents, api_keys, chat, deploy, knowledge, metrics, profile, teams, templates, trust};
use crate::store::{ApiKeyStore, TeamStore};

/// Room for several 10 MB knowledge files in one upload
const KNOWLEDGE_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// State shared by every handler
pub struct AppState {
    pub config: ConsoleConfig,
    pub http: reqwest::Client,
    pub secrets: Option<SecretBox>,
    pub privy: Option<PrivyVerifier>,
    pub privy_admin: Option<PrivyAdmin>,
    pub api_keys: ApiKeyStore,
    pub teams: TeamStore,
}

impl AppState {
    pub fn new(config: ConsoleConfig) -> Self {
        let http = reqwest::Client::new();

        let privy = match (&config.privy_app_id, &config.privy_verification_key) {
            (Some(app_id), Some(pem)) => match PrivyVerifier::new(app_id, pem) {
                Ok(verifier) => Some(verifier),
                Err(e) => {
                    warn!(error = %e, "Invalid Privy verification key, identity sessions disabled");
                    None
                }
            },
            _ => None,
        };
        let privy_admin = match (&config.privy_app_id, &config.privy_app_secret) {
            (Some(app_id), Some(secret)) => Some(PrivyAdmin::new(http.clone(), &config.privy_api_url, app_id, secret)),
            _ => None,
        };

        Self {
            secrets: config.secret_box(),
            api_keys: ApiKeyStore::new(&config.data_dir),
            teams: TeamStore::new(&config.data_dir),
            privy,
            privy_admin,
            http,
            config,
        }
    }

    /// Cloud API client, optionally authenticated with a session key
    pub fn cloud(&self, api_key: Option<&str>) -> CloudClient {
        CloudClient::with_http(
            self.http.clone(),
            self.config.cloud_api_url.clone(),
            self.config.cloud_api_version.clone(),
        )
        .with_api_key(api_key.map(str::to_string))
    }

    pub fn cookie_policy(&self) -> CookiePolicy {
        CookiePolicy {
            max_age: self.config.session_max_age,
            secure: self.config.secure_cookies,
        }
    }
}

/// Request body as JSON; anything unparseable reads as `null`.
pub fn read_json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

/// Web server
#[derive(Clone)]
pub struct WebServer {
    state: Arc<AppState>,
}

pub async fn serve(config: ConsoleConfig) -> anyhow::Result<()> {
    let addr = config.addr;
    WebServer::new(config).serve(addr).await
}

impl WebServer {
    pub fn new(config: ConsoleConfig) -> Self {
        Self::with_state(AppState::new(config))
    }

    pub fn with_state(state: AppState) -> Self {
        Self { state: Arc::new(state) }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Create router
    pub fn router(&self) -> Router {
        let gate = middleware::from_fn_with_state(self.state.clone(), pages::dashboard_gate);

        // Dashboard pages (session required)
        let dashboard = Router::new()
            .route("/dashboard", get(pages::overview))
            .route("/dashboard/", get(pages::overview))
            .route("/dashboard/instances", get(pages::instances))
            .route("/dashboard/instances/:id", get(pages::instance))
            .route("/dashboard/instances/:id/logs", get(pages::instance_logs))
            .route("/dashboard/instances/:id/metrics", get(pages::instance_metrics))
            .route("/dashboard/deploy", get(pages::deploy))
            .route("/dashboard/agents", get(pages::agents))
            .route("/dashboard/keys", get(pages::api_keys))
            .route("/dashboard/teams", get(pages::teams))
            .route("/dashboard/settings", get(pages::settings))
            .route("/dashboard/billing", get(pages::billing))
            .route("/dashboard/trust-center", get(pages::trust_center))
            .layer(gate)
            .with_state(self.state.clone());

        Router::new()
            .route("/", get(pages::root))
            .route("/login", get(pages::login))
            .route("/api/health", get(health_handler))

            // Session
            .route("/api/auth/csrf", get(auth::csrf::csrf_token))
            .route("/api/auth/api-key", post(auth::routes::login_api_key))
            .route("/api/auth/device-code", post(auth::routes::device_code))
            .route("/api/auth/device-token", post(auth::routes::device_token))
            .route("/api/auth/privy", post(auth::routes::login_privy))
            .route("/api/auth/session", get(auth::routes::session))
            .route("/api/auth/logout", post(auth::routes::logout))

            // Upstream pass-through
            .route("/api/cvms", any(proxy::cvms_root))
            .route("/api/deploy/provision", post(deploy::provision))
            .route("/api/deploy/compose", get(deploy::compose))
            .route("/api/cvms/*path", any(proxy::cvms_path))
            .route("/api/cloud/*path", get(proxy::cloud_path))
            .route("/api/teams", any(proxy::teams_root))
            .route("/api/teams/*path", any(proxy::teams_path))
            .route("/api/billing/*path", any(proxy::billing_path))

            // Agents
            .route(
                "/api/agents",
                get(agents::list_agents)
                    .post(proxy::agents_mutate)
                    .put(proxy::agents_mutate)
                    .patch(proxy::agents_mutate)
                    .delete(proxy::agents_mutate),
            )
            .route("/api/agents/config", get(agents::get_config).post(agents::post_config))
            .route("/api/agents/chat", post(chat::chat))
            .route(
                "/api/agents/knowledge",
                get(knowledge::list_files)
                    .post(knowledge::upload_files)
                    .delete(knowledge::delete_file)
                    .layer(DefaultBodyLimit::max(KNOWLEDGE_BODY_LIMIT)),
            )

            // Account services
            .route(
                "/api/keys",
                get(api_keys::list_keys).post(api_keys::create_key).delete(api_keys::revoke_key),
            )
            .route("/api/metrics/billing", get(metrics::billing))
            .route("/api/metrics/billing/usage", get(metrics::billing_usage))
            .route("/api/metrics/billing/invoices", get(metrics::billing_invoices))
            .route("/api/metrics/agents", get(metrics::agents))
            .route("/api/usage", get(metrics::usage))
            .route("/api/trust", get(trust::trust))
            .route("/api/team", get(teams::get_team))
            .route("/api/team/invite", post(teams::invite))
            .route("/api/team/role", post(teams::set_role))
            .route("/api/team/member", axum::routing::delete(teams::remove_member))
            .route("/api/templates", get(templates::templates))
            .route("/api/templates/:slug", get(templates::template))
            .route("/api/profile", get(profile::get_profile).post(profile::update_profile))

            .merge(dashboard)

            // Fallback
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("Nexis console starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_json() {
        assert_eq!(read_json(&Bytes::from_static(b"{\"a\":1}"))["a"], 1);
        assert_eq!(read_json(&Bytes::from_static(b"not json")), Value::Null);
        assert_eq!(read_json(&Bytes::new()), Value::Null);
    }

    #[test]
    fn test_cookie_policy_from_config() {
        let config = ConsoleConfig {
            session_max_age: 60,
            secure_cookies: true,
            ..ConsoleConfig::default()
        };
        let policy = AppState::new(config).cookie_policy();
        assert_eq!(policy.max_age, 60);
        assert!(policy.secure);
    }

    #[test]
    fn test_privy_disabled_without_key() {
        let config = ConsoleConfig {
            privy_app_id: Some("app".into()),
            privy_verification_key: Some("not a pem".into()),
            ..ConsoleConfig::default()
        };
        let state = AppState::new(config);
        assert!(state.privy.is_none());
        assert!(state.privy_admin.is_none());
    }
}
