//! Server-rendered dashboard pages.
//!
//! Pages fetch what they need from the upstream services on each request and
//! render plain HTML. Upstream failures become inline messages; a page never
//! fails as a whole. Mutations run in the browser against the `/api` routes.

mod account;
mod deploy;
mod instance;

pub use account::{agents, api_keys, settings, teams};
pub use deploy::{deploy, DeployQuery};
pub use instance::{instance, instance_logs, instance_metrics};

use axum::{
    extract::{Query, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use nexis_common::cvm::{format_disk, format_memory, CvmPage};
use nexis_common::CvmStatus;

use crate::auth::SessionCookies;
use crate::server::AppState;
use crate::services::metrics::{fetch_agents_summary, fetch_billing_summary, fetch_invoices, fetch_usage_series};
use crate::services::trust::fetch_trust_summary;

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Escape text for HTML element and attribute content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn or_dash(value: Option<&str>) -> String {
    value.map(escape).unwrap_or_else(|| "—".to_string())
}

fn number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{v:.0}"),
        Some(v) => format!("{v:.2}"),
        None => "—".to_string(),
    }
}

fn money(value: Option<f64>, currency: Option<&str>) -> String {
    match value {
        Some(v) => format!("{v:.2} {}", escape(currency.unwrap_or("USD"))),
        None => "—".to_string(),
    }
}

fn status_class(status: CvmStatus) -> &'static str {
    match status {
        CvmStatus::Running => "dot running",
        CvmStatus::Stopped => "dot stopped",
        _ => "dot pending",
    }
}

fn checked(on: bool) -> &'static str {
    if on {
        " checked"
    } else {
        ""
    }
}

/// Only same-site absolute paths are honoured as post-login redirects.
pub fn safe_redirect(target: Option<&str>) -> &str {
    match target {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path,
        _ => "/dashboard",
    }
}

// ============================================================================
// Layout
// ============================================================================

const STYLE: &str = r#"
body { font-family: ui-sans-serif, system-ui, -apple-system, Segoe UI, Roboto, Helvetica, Arial; margin: 0; color: #111827; background: #f9fafb; }
header { background: #0b1020; color: #e5e7eb; padding: 12px 24px; display: flex; flex-wrap: wrap; gap: 18px; align-items: center; }
header a { color: #e5e7eb; text-decoration: none; }
header .brand { font-weight: 700; margin-right: 12px; }
main { max-width: 1040px; margin: 0 auto; padding: 18px 24px; }
.card { border: 1px solid #e5e7eb; border-radius: 10px; padding: 14px 16px; margin: 12px 0; background: #fff; }
.grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(200px, 1fr)); gap: 12px; }
.row { display: flex; flex-wrap: wrap; gap: 8px; align-items: center; justify-content: space-between; }
.hint { color: #6b7280; }
.error { color: #b91c1c; }
table { width: 100%; border-collapse: collapse; }
th, td { text-align: left; padding: 8px 6px; border-bottom: 1px solid #e5e7eb; }
pre, code { background: #f3f4f6; padding: 2px 6px; border-radius: 6px; }
pre { padding: 12px; overflow: auto; }
pre.logs { max-height: 420px; white-space: pre-wrap; }
button, .button { padding: 9px 12px; border-radius: 8px; border: 1px solid #d1d5db; background: #111827; color: #fff; cursor: pointer; text-decoration: none; display: inline-block; }
button.secondary { background: #fff; color: #111827; }
button:disabled { opacity: 0.5; cursor: not-allowed; }
input, select, textarea { padding: 9px 12px; border-radius: 8px; border: 1px solid #d1d5db; width: 360px; max-width: 100%; box-sizing: border-box; }
input[type=checkbox] { width: auto; }
textarea { width: 100%; min-height: 120px; font-family: ui-monospace, SFMono-Regular, Menlo, monospace; }
label { display: block; margin: 10px 0 4px; }
.steps span { padding: 4px 10px; border-radius: 999px; background: #f3f4f6; margin-right: 6px; font-size: 12px; }
.bar { height: 8px; border-radius: 999px; background: #e5e7eb; }
.bar div { height: 8px; border-radius: 999px; background: #38bdf8; }
.dot { display: inline-block; width: 8px; height: 8px; border-radius: 50%; margin-right: 6px; background: #38bdf8; }
.dot.running { background: #22c55e; }
.dot.stopped { background: #9ca3af; }
"#;

const NAV: &[(&str, &str)] = &[
    ("/dashboard", "Overview"),
    ("/dashboard/instances", "Instances"),
    ("/dashboard/deploy", "Deploy"),
    ("/dashboard/agents", "Agents"),
    ("/dashboard/keys", "API Keys"),
    ("/dashboard/teams", "Teams"),
    ("/dashboard/billing", "Billing"),
    ("/dashboard/trust-center", "Trust Center"),
    ("/dashboard/settings", "Settings"),
];

fn layout(title: &str, body: &str) -> Html<String> {
    let title = escape(title);
    let nav: String = NAV
        .iter()
        .map(|(href, label)| format!(r#"<a href="{href}">{label}</a>"#))
        .collect();
    Html(format!(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{title} · Nexis Cloud</title>
    <style>{STYLE}</style>
  </head>
  <body>
    <header>
      <span class="brand">Nexis Cloud</span>
      {nav}
      <span style="flex:1"></span>
      <a href="/login" onclick="logout();return false;">Sign out</a>
    </header>
    <main>
      <h1>{title}</h1>
      {body}
    </main>
    <script>{CSRF_SCRIPT}{API_SCRIPT}</script>
  </body>
</html>"#
    ))
}

const CSRF_SCRIPT: &str = r#"
      async function csrfToken() {
        const r = await fetch('/api/auth/csrf', { credentials: 'same-origin' });
        const body = await r.json();
        return body.token;
      }"#;

/// `api(method, path, body)` resolves to `{ok, status, data}` and never throws
/// on HTTP errors. Mutations carry the CSRF header.
const API_SCRIPT: &str = r#"
      async function api(method, path, body) {
        const headers = { 'content-type': 'application/json' };
        if (method !== 'GET') headers['x-csrf-token'] = await csrfToken();
        const init = { method, headers, credentials: 'same-origin' };
        if (body !== undefined) init.body = JSON.stringify(body);
        const r = await fetch(path, init);
        const data = await r.json().catch(() => ({}));
        return { ok: r.ok, status: r.status, data };
      }
      async function logout() {
        await api('POST', '/api/auth/logout');
        window.location.href = '/login';
      }"#;

fn link_api_key_card(what: &str, redirect: &str) -> String {
    format!(
        r#"<div class="card">
        <h3>Link an API key to view {what}</h3>
        <p class="hint">This data is tied to your Nexis Cloud API key.</p>
        <a class="button" href="/login?link=api-key&amp;redirect={redirect}">Link API key</a>
      </div>"#,
        what = escape(what),
        redirect = escape(&urlencoding::encode(redirect)),
    )
}

fn error_card(message: &str) -> String {
    format!(r#"<div class="card error">{}</div>"#, escape(message))
}

// ============================================================================
// Dashboard gate
// ============================================================================

/// Redirects unauthenticated `/dashboard` requests to `/login`. With Privy
/// enabled only the identity cookie counts as a session.
pub async fn dashboard_gate(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let cookies = SessionCookies::from_headers(request.headers());
    let privy_enabled = state.config.privy_app_id.is_some();
    let authenticated = if privy_enabled {
        cookies.privy_token.is_some()
    } else {
        cookies.api_key.is_some() || cookies.privy_token.is_some()
    };
    if authenticated {
        return next.run(request).await;
    }

    let path = request.uri().path();
    let location = if path == "/dashboard" {
        "/login".to_string()
    } else {
        format!("/login?redirect={}", urlencoding::encode(path))
    };
    debug!(path, "Redirecting unauthenticated dashboard request");
    Redirect::temporary(&location).into_response()
}

// ============================================================================
// Pages
// ============================================================================

pub async fn root() -> Redirect {
    Redirect::temporary("/dashboard")
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    pub redirect: Option<String>,
}

const LOGIN_SCRIPT: &str = r#"
      const params = new URLSearchParams(window.location.search);
      const redirect = (() => {
        const target = params.get('redirect') || '/dashboard';
        return target.startsWith('/') && !target.startsWith('//') ? target : '/dashboard';
      })();
      const out = document.getElementById('out');

      async function post(path, body) {
        const r = await fetch(path, {
          method: 'POST',
          headers: { 'content-type': 'application/json', 'x-csrf-token': await csrfToken() },
          body: JSON.stringify(body || {}),
        });
        const data = await r.json().catch(() => ({}));
        return { ok: r.ok, status: r.status, data };
      }

      async function loginWithKey(event) {
        event.preventDefault();
        const apiKey = document.getElementById('apiKey').value.trim();
        const result = await post('/api/auth/api-key', { apiKey });
        if (result.ok) { window.location.href = redirect; return; }
        out.textContent = result.data.error || ('Login failed (' + result.status + ')');
      }

      async function startDevice() {
        const code = await post('/api/auth/device-code');
        if (!code.ok) { out.textContent = code.data.error || 'Unable to start device login.'; return; }
        const data = code.data;
        const uri = data.verification_uri_complete || data.verification_uri;
        out.textContent = 'Open ' + uri + ' and enter code ' + data.user_code;
        const interval = Math.max(Number(data.interval) || 5, 1) * 1000;
        const deadline = Date.now() + (Number(data.expires_in) || 600) * 1000;
        const poll = async () => {
          if (Date.now() > deadline) { out.textContent = 'Device code expired.'; return; }
          const token = await post('/api/auth/device-token', { device_code: data.device_code });
          if (token.ok) { window.location.href = redirect; return; }
          const pending = token.data && (token.data.error === 'authorization_pending' || token.data.error === 'slow_down');
          if (!pending) { out.textContent = token.data.error_description || token.data.error || 'Device login failed.'; return; }
          setTimeout(poll, interval);
        };
        setTimeout(poll, interval);
      }
"#;

/// GET /login
pub async fn login(Query(query): Query<LoginQuery>) -> Html<String> {
    let target = escape(safe_redirect(query.redirect.as_deref()));
    Html(format!(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Sign in · Nexis Cloud</title>
    <style>{STYLE}</style>
  </head>
  <body>
    <main>
      <h1>Sign in to Nexis Cloud</h1>
      <div class="card">
        <h3>API key</h3>
        <form onsubmit="loginWithKey(event)">
          <input id="apiKey" type="password" placeholder="phak_..." autocomplete="off" />
          <button type="submit">Continue</button>
        </form>
      </div>
      <div class="card">
        <h3>Device login</h3>
        <p class="hint">Authorise this browser from the Nexis Cloud website.</p>
        <button onclick="startDevice()">Start device login</button>
      </div>
      <p class="hint">After signing in you will continue to <code>{target}</code>.</p>
      <pre id="out"></pre>
    </main>
    <script>{CSRF_SCRIPT}{LOGIN_SCRIPT}</script>
  </body>
</html>"#
    ))
}

/// GET /dashboard
pub async fn overview(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return layout("Overview", &link_api_key_card("your instances", "/dashboard"));
    };

    let cloud = state.cloud(Some(api_key));
    let (cvms, billing, agents) = tokio::join!(
        cloud.list_cvms(1, DEFAULT_PAGE_SIZE),
        fetch_billing_summary(&state, Some(api_key)),
        fetch_agents_summary(&state, Some(api_key)),
    );

    let mut body = String::from(r#"<div class="grid">"#);
    match &cvms {
        Ok(page) => {
            let running = page.items.iter().filter(|c| c.status == CvmStatus::Running).count();
            body.push_str(&format!(
                r#"<div class="card"><div class="hint">Instances</div><h2>{}</h2><div class="hint">{running} running on this page</div></div>"#,
                page.total
            ));
        }
        Err(e) => body.push_str(&error_card(&e.to_string())),
    }
    match &billing {
        Ok(summary) => body.push_str(&format!(
            r#"<div class="card"><div class="hint">Month to date</div><h2>{}</h2><div class="hint">Balance {}</div></div>"#,
            money(summary.monthly_cost, summary.currency.as_deref()),
            money(summary.balance, summary.currency.as_deref()),
        )),
        Err(e) => body.push_str(&error_card(e)),
    }
    match &agents {
        Ok(summary) => body.push_str(&format!(
            r#"<div class="card"><div class="hint">Agents</div><h2>{}</h2><div class="hint">{} total</div></div>"#,
            number(summary.active_agents),
            number(summary.total_agents),
        )),
        Err(e) => body.push_str(&error_card(e)),
    }
    body.push_str("</div>");

    if let Ok(page) = &cvms {
        body.push_str(&instances_table(page));
    }
    layout("Overview", &body)
}

fn instances_table(page: &CvmPage) -> String {
    if page.items.is_empty() {
        return r#"<div class="card hint">No instances yet. <a href="/dashboard/deploy">Deploy one</a>.</div>"#.to_string();
    }
    let rows: String = page
        .items
        .iter()
        .map(|cvm| {
            format!(
                r#"<tr><td><a href="/dashboard/instances/{id_attr}">{name}</a></td><td><span class="{class}"></span>{status}</td><td>{region}</td><td>{vcpu}</td><td>{memory}</td><td>{disk}</td></tr>"#,
                id_attr = escape(&urlencoding::encode(&cvm.id)),
                name = escape(&cvm.name),
                class = status_class(cvm.status),
                status = cvm.status.as_str(),
                region = or_dash(cvm.region.as_deref()),
                vcpu = number(cvm.vcpu),
                memory = format_memory(cvm.memory),
                disk = format_disk(cvm.disk_size),
            )
        })
        .collect();
    format!(
        r#"<div class="card"><table>
        <thead><tr><th>Name</th><th>Status</th><th>Region</th><th>vCPU</th><th>Memory</th><th>Disk</th></tr></thead>
        <tbody>{rows}</tbody>
      </table></div>"#
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

impl PageQuery {
    /// `page` ≥ 1 and `page_size` in 1..=100, defaulting to 1 and 20.
    pub fn resolve(&self) -> (u64, u64) {
        let page = self.page.filter(|p| *p >= 1).unwrap_or(1);
        let page_size = self
            .page_size
            .filter(|s| *s >= 1)
            .map(|s| s.min(MAX_PAGE_SIZE))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        (page, page_size)
    }
}

/// GET /dashboard/instances
pub async fn instances(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return layout("Instances", &link_api_key_card("your instances", "/dashboard/instances"));
    };
    let (page, page_size) = query.resolve();
    let body = match state.cloud(Some(api_key)).list_cvms(page, page_size).await {
        Ok(result) => {
            let mut body = String::from(r#"<p><a class="button" href="/dashboard/deploy">Deploy CVM</a></p>"#);
            body.push_str(&instances_table(&result));
            body.push_str(&format!(
                r#"<p class="hint">Page {} of {} · {} total</p><p>"#,
                result.page,
                result.pages.max(1),
                result.total
            ));
            if result.page > 1 {
                body.push_str(&format!(
                    r#"<a class="button" href="/dashboard/instances?page={}&amp;page_size={page_size}">Previous</a> "#,
                    result.page - 1
                ));
            }
            if result.page < result.pages {
                body.push_str(&format!(
                    r#"<a class="button" href="/dashboard/instances?page={}&amp;page_size={page_size}">Next</a>"#,
                    result.page + 1
                ));
            }
            body.push_str("</p>");
            body
        }
        Err(e) => error_card(&e.to_string()),
    };
    layout("Instances", &body)
}

/// GET /dashboard/billing
pub async fn billing(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return layout("Billing", &link_api_key_card("billing", "/dashboard/billing"));
    };
    let (summary, invoices, series) = tokio::join!(
        fetch_billing_summary(&state, Some(api_key)),
        fetch_invoices(&state, Some(api_key)),
        fetch_usage_series(&state, Some(api_key)),
    );

    let mut body = String::new();
    let currency = summary
        .as_ref()
        .ok()
        .and_then(|s| s.currency.clone())
        .or_else(|| series.as_ref().ok().and_then(|s| s.first()).and_then(|p| p.currency.clone()));
    match &summary {
        Ok(s) => body.push_str(&format!(
            r#"<div class="grid"><div class="card"><div class="hint">Month to date</div><h2>{}</h2></div><div class="card"><div class="hint">Balance</div><h2>{}</h2></div></div>"#,
            money(s.monthly_cost, currency.as_deref()),
            money(s.balance, currency.as_deref()),
        )),
        Err(e) => body.push_str(&error_card(e)),
    }

    body.push_str(r#"<div class="card"><h3>Usage</h3>"#);
    match &series {
        Ok(points) => {
            body.push_str("<table><thead><tr><th>Date</th><th>Cost</th></tr></thead><tbody>");
            for point in points {
                body.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td></tr>",
                    escape(&point.date),
                    money(point.cost, point.currency.as_deref().or(currency.as_deref())),
                ));
            }
            body.push_str("</tbody></table>");
        }
        Err(e) => body.push_str(&format!(r#"<p class="hint">{}</p>"#, escape(e))),
    }
    body.push_str("</div>");

    body.push_str(r#"<div class="card"><h3>Invoices</h3>"#);
    match &invoices {
        Ok(items) if items.is_empty() => body.push_str(r#"<p class="hint">No invoices available.</p>"#),
        Ok(items) => {
            body.push_str("<table><thead><tr><th>Invoice</th><th>Amount</th><th>Status</th><th>Issued</th><th>Due</th><th></th></tr></thead><tbody>");
            for invoice in items {
                let link = invoice
                    .hosted_url
                    .as_deref()
                    .or(invoice.pdf_url.as_deref())
                    .map(|url| format!(r#"<a href="{}" rel="noopener" target="_blank">View</a>"#, escape(url)))
                    .unwrap_or_default();
                body.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{link}</td></tr>",
                    escape(&invoice.id),
                    money(invoice.amount, invoice.currency.as_deref()),
                    or_dash(invoice.status.as_deref()),
                    or_dash(invoice.issued_at.as_deref()),
                    or_dash(invoice.due_at.as_deref()),
                ));
            }
            body.push_str("</tbody></table>");
        }
        Err(e) => body.push_str(&format!(r#"<p class="hint">{}</p>"#, escape(e))),
    }
    body.push_str("</div>");
    layout("Billing", &body)
}

/// GET /dashboard/trust-center
pub async fn trust_center(State(state): State<Arc<AppState>>) -> Html<String> {
    let body = match fetch_trust_summary(&state).await {
        Ok(summary) => {
            let mut body = format!(
                r#"<div class="card"><p>Overall status: <b>{}</b></p><p class="hint">Updated {}</p></div>"#,
                or_dash(summary.overall_status.as_deref()),
                or_dash(summary.updated_at.as_deref()),
            );
            body.push_str(r#"<div class="card"><h3>Services</h3><table><tbody>"#);
            for service in &summary.services {
                body.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td class=\"hint\">{}</td></tr>",
                    escape(&service.name),
                    escape(&service.status),
                    or_dash(service.description.as_deref()),
                ));
            }
            body.push_str("</tbody></table></div>");
            body.push_str(r#"<div class="card"><h3>Incidents</h3>"#);
            if summary.incidents.is_empty() {
                body.push_str(r#"<p class="hint">No active incidents.</p>"#);
            }
            for incident in &summary.incidents {
                body.push_str(&format!(
                    "<p><b>{}</b> · {} <span class=\"hint\">{} → {}</span></p>",
                    escape(&incident.name),
                    escape(&incident.status),
                    or_dash(incident.started_at.as_deref()),
                    or_dash(incident.resolved_at.as_deref()),
                ));
            }
            body.push_str("</div>");
            body
        }
        Err(e) => error_card(&e),
    };
    layout("Trust Center", &body)
}
