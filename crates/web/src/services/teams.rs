//! Team membership: proxied to the teams service, or kept locally.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::RequestAuth;
use crate::auth::{identity_headers, require_csrf};
use crate::error::{ApiError, ApiResult};
use crate::proxy::{needs_team_prefix, ProxyRequest, ServiceProxy};
use crate::server::{read_json, AppState};
use crate::store::{TeamRecord, TeamRole};

/// Teams service proxy for `/team/<path>` with identity headers.
fn team_proxy(state: &AppState, auth: &RequestAuth, path: &[&str]) -> ServiceProxy {
    let base = state.config.teams_api_url.clone();
    let prefix = needs_team_prefix(base.as_deref()).then_some("team");
    identity_headers(Some(&auth.identity))
        .into_iter()
        .fold(ServiceProxy::new("Teams", base), |proxy, (name, value)| proxy.header(name, value))
        .segments(prefix.into_iter().chain(path.iter().copied()))
}

fn remote(state: &AppState) -> bool {
    state
        .config
        .teams_api_url
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty())
}

fn team_response(team: TeamRecord) -> Response {
    Json(json!({ "team": team })).into_response()
}

async fn load_team(state: &AppState, auth: &RequestAuth) -> ApiResult<TeamRecord> {
    Ok(state.teams.get_or_create(&auth.identity.id, None).await?)
}

/// Local mutations are reserved for admins of the team.
async fn load_team_as_admin(state: &AppState, auth: &RequestAuth) -> ApiResult<TeamRecord> {
    let team = load_team(state, auth).await?;
    if team.member_role(&auth.identity.id) != Some(TeamRole::Admin) {
        return Err(ApiError::Forbidden("Only team admins can manage members.".to_string()));
    }
    Ok(team)
}

fn text_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn role_field(body: &Value, default: Option<TeamRole>) -> ApiResult<TeamRole> {
    match text_field(body, "role") {
        Some(role) => TeamRole::parse(role).ok_or_else(|| ApiError::validation("Invalid role.")),
        None => default.ok_or_else(|| ApiError::validation("role is required")),
    }
}

/// GET /api/team
pub async fn get_team(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &request.headers)?;
    if remote(&state) {
        return team_proxy(&state, &auth, &[]).forward(&state.http, request).await;
    }
    Ok(team_response(load_team(&state, &auth).await?))
}

/// POST /api/team/invite `{email, role?}`
pub async fn invite(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &request.headers)?;
    if remote(&state) {
        return team_proxy(&state, &auth, &["invite"]).forward(&state.http, request).await;
    }
    require_csrf(&request.headers)?;
    let body = read_json(&request.body);
    let email = text_field(&body, "email").unwrap_or_default();
    let role = role_field(&body, Some(TeamRole::Viewer))?;

    let team = load_team_as_admin(&state, &auth).await?;
    let team = state.teams.invite(team, email, role).await?;
    info!(role = ?role, "Team member invited");
    Ok(team_response(team))
}

/// POST /api/team/role `{memberId, role}`
pub async fn set_role(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &request.headers)?;
    if remote(&state) {
        return team_proxy(&state, &auth, &["role"]).forward(&state.http, request).await;
    }
    require_csrf(&request.headers)?;
    let body = read_json(&request.body);
    let member_id = text_field(&body, "memberId").ok_or_else(|| ApiError::validation("memberId is required"))?;
    let role = role_field(&body, None)?;

    let team = load_team_as_admin(&state, &auth).await?;
    let team = state.teams.set_role(team, member_id, role).await?;
    Ok(team_response(team))
}

/// DELETE /api/team/member `{memberId}`
pub async fn remove_member(State(state): State<Arc<AppState>>, request: ProxyRequest) -> ApiResult<Response> {
    let auth = RequestAuth::require(&state, &request.headers)?;
    if remote(&state) {
        return team_proxy(&state, &auth, &["member"]).forward(&state.http, request).await;
    }
    require_csrf(&request.headers)?;
    let body = read_json(&request.body);
    let member_id = text_field(&body, "memberId").ok_or_else(|| ApiError::validation("memberId is required"))?;

    let team = load_team_as_admin(&state, &auth).await?;
    let team = state.teams.remove(team, member_id).await?;
    info!(member_id, "Team member removed");
    Ok(team_response(team))
}
