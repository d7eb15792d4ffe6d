//! Account pages: agents, API keys, teams and settings.

use axum::{extract::State, http::HeaderMap, response::Html};
use std::sync::Arc;
use tracing::debug;

use super::{error_card, escape, layout, link_api_key_card, number, or_dash};
use crate::auth::{resolve_identity, AuthMethod, SessionCookies};
use crate::server::AppState;
use crate::services::agents::{list_agent_configs, AgentConfigView};
use crate::services::api_keys::load_keys;
use crate::services::metrics::{fetch_api_usage, ApiUsageSummary};
use crate::services::profile::{current_user, ProfileSummary};
use crate::services::templates::{list_templates, AgentTemplate};
use crate::services::{require_base, RequestAuth};
use crate::store::ApiKeyView;

// ============================================================================
// Agents
// ============================================================================

fn agents_table(configs: &[AgentConfigView]) -> String {
    if configs.is_empty() {
        return r#"<p class="hint">No agents configured yet.</p>"#.to_string();
    }
    let rows: String = configs
        .iter()
        .map(|config| {
            format!(
                r#"<tr><td><a href="/dashboard/instances/{id_attr}">{name}</a></td><td>{model}</td><td>{endpoint}</td><td>{keys}</td><td>{updated}</td></tr>"#,
                id_attr = escape(&urlencoding::encode(&config.app_id)),
                name = escape(&config.name),
                model = or_dash(config.model.as_deref()),
                endpoint = or_dash(config.endpoint_url.as_deref()),
                keys = config.env_keys.len() + config.header_keys.len(),
                updated = escape(&config.updated_at),
            )
        })
        .collect();
    format!(
        "<table><thead><tr><th>Agent</th><th>Model</th><th>Endpoint</th><th>Secrets</th><th>Updated</th></tr></thead><tbody>{rows}</tbody></table>"
    )
}

fn template_cards(templates: &[AgentTemplate]) -> String {
    if templates.is_empty() {
        return r#"<p class="hint">No templates available.</p>"#.to_string();
    }
    let cards: String = templates
        .iter()
        .map(|template| {
            format!(
                r#"<div class="card"><h3>{name}</h3><p class="hint">{description}</p><a class="button" href="/dashboard/deploy?template={slug}">Deploy</a></div>"#,
                name = escape(&template.name),
                description = escape(&template.description),
                slug = escape(&urlencoding::encode(&template.slug)),
            )
        })
        .collect();
    format!(r#"<div class="grid">{cards}</div>"#)
}

/// GET /dashboard/agents
pub async fn agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let mut body = String::from(r#"<div class="card"><h3>Configured agents</h3>"#);
    let configs = match RequestAuth::require(&state, &headers) {
        Ok(auth) => match require_base(&state.config.agents_api_url, "Agents") {
            Ok(base) => list_agent_configs(&auth.client(&state, base))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        Err(e) => Err(e.to_string()),
    };
    match configs {
        Ok(configs) => body.push_str(&agents_table(&configs)),
        Err(e) => {
            debug!(error = %e, "Agent list unavailable");
            body.push_str(&format!(r#"<p class="hint">{}</p>"#, escape(&e)));
        }
    }
    body.push_str("</div><h2>Templates</h2>");
    body.push_str(&template_cards(&list_templates(&state.config.templates_dir).await));
    layout("Agents", &body)
}

// ============================================================================
// API keys
// ============================================================================

pub const DEFAULT_KEY_LABEL: &str = "Nexis CLI key";

const KEYS_SCRIPT: &str = r#"
      (function () {
        const out = document.getElementById('keys-out');
        const secret = document.getElementById('key-secret');
        document.getElementById('key-form').addEventListener('submit', async (event) => {
          event.preventDefault();
          out.textContent = '';
          const label = event.target.elements.label.value.trim();
          const r = await api('POST', '/api/keys', { label });
          if (!r.ok) { out.textContent = r.data.error || 'Unable to create API key.'; return; }
          secret.hidden = false;
          secret.querySelector('pre').textContent = r.data.secret || 'The key service did not return a secret.';
        });
        document.querySelectorAll('button[data-revoke]').forEach((button) => {
          button.addEventListener('click', async () => {
            if (!confirm('Revoke this API key?')) return;
            const r = await api('DELETE', '/api/keys', { id: button.dataset.revoke });
            if (!r.ok) { out.textContent = r.data.error || 'Unable to revoke API key.'; return; }
            window.location.reload();
          });
        });
      })();
"#;

fn usage_card(usage: &ApiUsageSummary) -> String {
    format!(
        r#"<div class="grid">
        <div class="card"><div class="hint">Requests</div><h2>{}</h2></div>
        <div class="card"><div class="hint">Errors</div><h2>{}</h2></div>
        <div class="card"><div class="hint">Tokens used</div><h2>{}</h2></div>
      </div><p class="hint">{}</p>"#,
        number(usage.request_count),
        number(usage.error_count),
        number(usage.tokens_used),
        escape(usage.period_label.as_deref().unwrap_or("Current period")),
    )
}

fn keys_table(keys: &[ApiKeyView]) -> String {
    if keys.is_empty() {
        return r#"<p class="hint">No API keys yet.</p>"#.to_string();
    }
    let rows: String = keys
        .iter()
        .map(|key| {
            let action = match key.revoked_at {
                Some(_) => String::new(),
                None => format!(
                    r#"<button type="button" class="secondary" data-revoke="{}">Revoke</button>"#,
                    escape(&key.id)
                ),
            };
            format!(
                "<tr><td>{}</td><td><code>{}…</code></td><td>{}</td><td>{}</td><td>{}</td><td>{action}</td></tr>",
                escape(&key.label),
                escape(&key.prefix),
                or_dash(key.created_at.as_deref()),
                or_dash(key.last_used_at.as_deref()),
                if key.revoked_at.is_some() { "revoked" } else { "active" },
            )
        })
        .collect();
    format!(
        "<table><thead><tr><th>Label</th><th>Prefix</th><th>Created</th><th>Last used</th><th>Status</th><th></th></tr></thead><tbody>{rows}</tbody></table>"
    )
}

/// GET /dashboard/keys
pub async fn api_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return layout("API Keys", &link_api_key_card("API keys", "/dashboard/keys"));
    };
    let (usage, keys) = tokio::join!(fetch_api_usage(&state, Some(api_key)), load_keys(&state, api_key));

    let mut body = match &usage {
        Ok(usage) => usage_card(usage),
        Err(e) => format!(r#"<p class="hint">{}</p>"#, escape(e)),
    };
    body.push_str(&format!(
        r#"<div class="card">
        <h3>Create a key</h3>
        <form id="key-form"><input name="label" value="{DEFAULT_KEY_LABEL}" /> <button type="submit">Create key</button></form>
        <div id="key-secret" hidden><p>Copy this key now. It will not be shown again.</p><pre></pre><a href="/dashboard/keys">Done</a></div>
        <p id="keys-out" class="error"></p>
      </div>"#
    ));
    body.push_str(r#"<div class="card"><h3>Keys</h3>"#);
    match &keys {
        Ok(keys) => body.push_str(&keys_table(keys)),
        Err(e) => body.push_str(&error_card(&e.to_string())),
    }
    body.push_str("</div>");
    body.push_str(&format!("<script>{KEYS_SCRIPT}</script>"));
    layout("API Keys", &body)
}

// ============================================================================
// Teams
// ============================================================================

const TEAM_SCRIPT: &str = r#"
      (function () {
        const box = document.getElementById('team');
        const out = document.getElementById('team-out');
        const ROLES = ['admin', 'editor', 'viewer'];

        function cell(row, text) {
          const td = row.insertCell();
          td.textContent = text || '—';
          return td;
        }
        function render(team) {
          document.getElementById('team-name').textContent = team.name || 'Team';
          const body = box.querySelector('tbody');
          body.innerHTML = '';
          (team.members || []).forEach((member) => {
            const row = body.insertRow();
            cell(row, member.email);
            const select = document.createElement('select');
            ROLES.forEach((role) => select.add(new Option(role, role, false, role === member.role)));
            select.addEventListener('change', () => mutate('POST', '/api/team/role', { memberId: member.id, role: select.value }));
            row.insertCell().appendChild(select);
            cell(row, member.status);
            cell(row, member.joinedAt || member.invitedAt);
            const remove = document.createElement('button');
            remove.type = 'button';
            remove.className = 'secondary';
            remove.textContent = 'Remove';
            remove.addEventListener('click', () => {
              if (confirm('Remove ' + member.email + ' from the team?')) mutate('DELETE', '/api/team/member', { memberId: member.id });
            });
            row.insertCell().appendChild(remove);
          });
        }
        async function mutate(method, path, body) {
          out.textContent = '';
          const r = await api(method, path, body);
          if (!r.ok) { out.textContent = r.data.error || 'Unable to update the team.'; return; }
          if (r.data.team) render(r.data.team); else load();
        }
        async function load() {
          const r = await api('GET', '/api/team');
          if (!r.ok) { out.textContent = r.data.error || 'Unable to load the team.'; return; }
          render(r.data.team || {});
        }
        document.getElementById('invite-form').addEventListener('submit', (event) => {
          event.preventDefault();
          const form = event.target;
          mutate('POST', '/api/team/invite', { email: form.elements.email.value.trim(), role: form.elements.role.value });
          form.reset();
        });
        load();
      })();
"#;

/// GET /dashboard/teams
pub async fn teams() -> Html<String> {
    let body = format!(
        r#"<div class="card" id="team">
        <h3 id="team-name">Team</h3>
        <table><thead><tr><th>Email</th><th>Role</th><th>Status</th><th>Since</th><th></th></tr></thead><tbody></tbody></table>
      </div>
      <div class="card">
        <h3>Invite a member</h3>
        <form id="invite-form">
          <input name="email" type="email" placeholder="teammate@example.com" required />
          <select name="role"><option value="viewer">viewer</option><option value="editor">editor</option><option value="admin">admin</option></select>
          <button type="submit">Invite</button>
        </form>
        <p id="team-out" class="error"></p>
      </div>
      <script>{TEAM_SCRIPT}</script>"#
    );
    layout("Teams", &body)
}

// ============================================================================
// Settings
// ============================================================================

const PROFILE_SCRIPT: &str = r#"
      (function () {
        const form = document.getElementById('profile-form');
        if (!form) return;
        const out = document.getElementById('profile-out');
        form.addEventListener('submit', async (event) => {
          event.preventDefault();
          const r = await api('POST', '/api/profile', {
            displayName: form.elements.displayName.value,
            avatarUrl: form.elements.avatarUrl.value,
          });
          out.className = r.ok ? 'hint' : 'error';
          out.textContent = r.ok ? 'Profile saved.' : (r.data.error || 'Unable to save profile.');
        });
      })();
"#;

fn profile_card(summary: &ProfileSummary) -> String {
    let avatar = summary
        .avatar_url
        .as_deref()
        .map(|url| format!(r#"<img src="{}" alt="" width="48" height="48" style="border-radius:50%" /> "#, escape(url)))
        .unwrap_or_default();
    format!(
        r#"<div class="card">
        <p>{avatar}<b>{name}</b> <span class="hint">{email}</span></p>
        <form id="profile-form">
          <label>Display name</label><input name="displayName" value="{name}" maxlength="80" />
          <label>Avatar URL</label><input name="avatarUrl" value="{avatar_url}" maxlength="320" />
          <p><button type="submit">Save profile</button></p>
        </form>
        <p id="profile-out"></p>
      </div>"#,
        name = escape(&summary.display_name),
        email = or_dash(summary.email.as_deref()),
        avatar_url = escape(summary.avatar_url.as_deref().unwrap_or("")),
    )
}

/// GET /dashboard/settings
pub async fn settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let identity = resolve_identity(&state, &cookies);

    let mut body = match &identity {
        Some(identity) if identity.method == AuthMethod::Privy => match current_user(&state, &headers).await {
            Ok(user) => profile_card(&ProfileSummary::from_user(&user)),
            Err(e) => error_card(&e.to_string()),
        },
        _ => r#"<div class="card hint">Profile editing requires a Privy sign-in.</div>"#.to_string(),
    };

    body.push_str(&format!(
        r#"<div class="card"><h3>Session</h3><p>Signed in via {method}</p><p class="hint">{id}</p></div>"#,
        method = identity.as_ref().map(|i| i.method.as_str()).unwrap_or("—"),
        id = or_dash(identity.as_ref().map(|i| i.id.as_str())),
    ));
    if cookies.api_key.is_some() {
        body.push_str(r#"<div class="card"><h3>API key</h3><p>A Nexis Cloud API key is linked to this session.</p></div>"#);
    } else {
        body.push_str(&link_api_key_card("instances and billing", "/dashboard/settings"));
    }
    body.push_str(&format!("<script>{PROFILE_SCRIPT}</script>"));
    layout("Settings", &body)
}
