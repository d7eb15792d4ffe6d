//! Instance detail: lifecycle actions, visibility, logs and metrics.
//!
//! Logs and metrics are rendered here as fragments and polled by the page.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Html,
};
use std::sync::Arc;

use nexis_common::cvm::{
    failure_message, format_bytes, format_disk, format_memory, format_uptime, normalize_cvm_id, normalize_logs,
    tail_lines, CvmDetail, CvmStats, SysInfo, LOGS_FAILED, LOGS_UNREACHABLE, LOG_TAIL_LINES, STATS_FAILED,
    STATS_UNREACHABLE,
};
use nexis_common::upstream::FetchResult;
use nexis_common::{CvmStatus, Result};

use super::{checked, error_card, escape, layout, link_api_key_card, number, or_dash, status_class};
use crate::auth::SessionCookies;
use crate::server::AppState;

/// Browser side of the live state stream. Reconnects 3 s after every
/// `complete`, `timeout` or `error`, flipping the target between `running`
/// and `stopped` based on the latest status. An `error` payload without a
/// message keeps the current note.
const STATE_SCRIPT: &str = r#"
      (function () {
        const el = document.getElementById('cvm-state');
        if (!el) return;
        const appId = el.dataset.appId;
        let status = el.dataset.status || 'unknown';
        let source = null;
        let retry = null;
        const label = el.querySelector('.label');
        const dot = el.querySelector('.dot');
        const note = el.querySelector('.note');

        function render(message) {
          const s = (status || 'unknown').trim().toLowerCase();
          label.textContent = status || 'unknown';
          dot.className = 'dot ' + (s === 'running' ? 'running' : s === 'stopped' ? 'stopped' : 'pending');
          if (message !== undefined) note.textContent = message ? ' · ' + message : '';
        }
        function close() { if (source) { source.close(); source = null; } }
        function reconnect() {
          close();
          if (retry) clearTimeout(retry);
          retry = setTimeout(start, 3000);
        }
        function parse(data) { try { return JSON.parse(data); } catch (_) { return null; } }
        function start() {
          close();
          const current = (status || 'unknown').trim().toLowerCase();
          const target = current === 'running' ? 'stopped' : 'running';
          source = new EventSource('/api/cvms/' + encodeURIComponent(appId) + '/state?target=' + encodeURIComponent(target));
          source.addEventListener('state', (e) => {
            const p = parse(e.data);
            if (p && p.status) { status = p.status; render('updated ' + new Date().toLocaleTimeString()); }
          });
          source.addEventListener('complete', (e) => {
            const p = parse(e.data);
            if (p && p.status) { status = p.status; render('updated ' + new Date().toLocaleTimeString()); }
            reconnect();
          });
          source.addEventListener('timeout', () => { render('State stream timed out. Reconnecting...'); reconnect(); });
          source.addEventListener('error', (e) => {
            if (e.data) {
              const p = parse(e.data);
              if (p && p.error) render(p.error);
            } else {
              render('Connection lost. Reconnecting...');
            }
            reconnect();
          });
        }
        window.addEventListener('beforeunload', () => { if (retry) clearTimeout(retry); close(); });
        start();
      })();
"#;

/// Lifecycle buttons, visibility form and the logs/metrics pollers.
const CONTROLS_SCRIPT: &str = r#"
      (function () {
        const box = document.getElementById('cvm-actions');
        if (!box) return;
        const appId = box.dataset.appId;
        const base = '/api/cvms/' + encodeURIComponent(appId);
        const out = document.getElementById('action-out');

        box.querySelectorAll('button[data-action]').forEach((button) => {
          button.addEventListener('click', async () => {
            const action = button.dataset.action;
            if (action === 'delete' && !confirm('Terminate this CVM? This action cannot be undone.')) return;
            out.textContent = '';
            const r = action === 'delete' ? await api('DELETE', base + '/delete') : await api('POST', base + '/' + action);
            if (!r.ok) { out.textContent = r.data.error || 'Unable to perform action.'; return; }
            window.location.href = action === 'delete' ? '/dashboard/instances' : window.location.pathname;
          });
        });

        async function setVisibility(publicSysinfo, publicLogs, fallback) {
          const r = await api('PATCH', base + '/visibility', { public_sysinfo: publicSysinfo, public_logs: publicLogs });
          if (!r.ok) { out.textContent = r.data.error || fallback; return; }
          window.location.reload();
        }
        const form = document.getElementById('visibility-form');
        form.addEventListener('submit', (event) => {
          event.preventDefault();
          setVisibility(form.elements.public_sysinfo.checked, form.elements.public_logs.checked, 'Unable to update visibility settings.');
        });
        document.querySelectorAll('button[data-enable]').forEach((button) => {
          button.addEventListener('click', () => {
            const logs = button.dataset.enable === 'logs';
            setVisibility(logs ? box.dataset.publicSysinfo === 'true' : true, logs ? true : box.dataset.publicLogs === 'true',
              logs ? 'Unable to enable logs.' : 'Unable to enable system info.');
          });
        });

        const history = [];
        function sparklines(body) {
          const el = body.querySelector('[data-usage]');
          if (!el) return;
          history.push(JSON.parse(el.dataset.usage));
          while (history.length > 30) history.shift();
          body.querySelectorAll('svg[data-series]').forEach((svg) => {
            const values = history.map((point) => point[svg.dataset.series]);
            if (values.length < 2) return;
            const min = Math.min(...values);
            const range = (Math.max(...values) - min) || 1;
            const points = values.map((v, i) => ((i / (values.length - 1)) * 116 + 2).toFixed(1) + ',' + (30 - ((v - min) / range) * 28).toFixed(1));
            svg.innerHTML = '<polyline fill="none" stroke="rgb(56,189,248)" stroke-width="2" points="' + points.join(' ') + '"/>';
          });
        }

        function poller(id, every, onLoad) {
          const panel = document.getElementById(id);
          if (!panel) return;
          const body = panel.querySelector('[data-role=body]');
          const stamp = panel.querySelector('[data-role=stamp]');
          const toggle = panel.querySelector('[data-role=auto]');
          let timer = null;
          async function load() {
            try {
              const r = await fetch(panel.dataset.src, { cache: 'no-store', credentials: 'same-origin' });
              body.innerHTML = await r.text();
              stamp.textContent = 'Updated ' + new Date().toLocaleTimeString();
              if (onLoad) onLoad(body);
            } catch (_) {
              body.innerHTML = '<p class="error"></p>';
              body.firstChild.textContent = panel.dataset.unreachable;
            }
          }
          function auto(on) {
            if (timer) clearInterval(timer);
            timer = on ? setInterval(load, every) : null;
            toggle.textContent = on ? 'Auto-refresh on' : 'Auto-refresh off';
          }
          toggle.addEventListener('click', () => auto(!timer));
          panel.querySelector('[data-role=refresh]').addEventListener('click', load);
          load();
          auto(true);
        }
        poller('cvm-logs', 7000);
        poller('cvm-metrics', 15000, sparklines);
      })();
"#;

fn instance_detail(detail: &CvmDetail) -> String {
    let mut body = format!(
        r#"<div class="card">
        <p>Status: <span id="cvm-state" data-app-id="{app_id}" data-status="{status}"><span class="{class}"></span><span class="label">{status}</span><span class="note hint"></span></span></p>
        <div class="grid">
          <div><div class="hint">App ID</div><code>{app_id}</code></div>
          <div><div class="hint">VM UUID</div>{vm_uuid}</div>
          <div><div class="hint">Region</div>{region}</div>
          <div><div class="hint">vCPU</div>{vcpu}</div>
          <div><div class="hint">Memory</div>{memory}</div>
          <div><div class="hint">Disk</div>{disk}</div>
          <div><div class="hint">Public logs</div>{logs}</div>
          <div><div class="hint">Public sysinfo</div>{sysinfo}</div>
        </div>
      </div>"#,
        app_id = escape(&detail.app_id),
        status = detail.status.as_str(),
        class = status_class(detail.status),
        vm_uuid = or_dash(detail.vm_uuid.as_deref()),
        region = or_dash(detail.region.as_deref()),
        vcpu = number(detail.vcpu),
        memory = format_memory(detail.memory),
        disk = format_disk(detail.disk_size),
        logs = if detail.public_logs { "yes" } else { "no" },
        sysinfo = if detail.public_sysinfo { "yes" } else { "no" },
    );

    if let Some(ssh) = detail.ssh() {
        body.push_str(&format!(
            r#"<div class="card"><h3>SSH</h3><pre>{}</pre></div>"#,
            escape(&ssh.command)
        ));
    }
    if !detail.public_urls.is_empty() {
        body.push_str(r#"<div class="card"><h3>Endpoints</h3><ul>"#);
        for url in &detail.public_urls {
            body.push_str(&format!(
                r#"<li><a href="{app}" rel="noopener" target="_blank">{app}</a> <span class="hint">{instance}</span></li>"#,
                app = escape(&url.app),
                instance = escape(&url.instance),
            ));
        }
        body.push_str("</ul></div>");
    }
    body
}

/// Lifecycle button availability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionAvailability {
    pub start: bool,
    pub stop: bool,
    pub restart: bool,
    pub delete: bool,
}

impl ActionAvailability {
    /// Nothing while an operation is in flight; start only when not running,
    /// stop only when not stopped.
    pub fn for_detail(detail: &CvmDetail) -> Self {
        let idle = !detail.in_progress;
        Self {
            start: idle && detail.status != CvmStatus::Running,
            stop: idle && detail.status != CvmStatus::Stopped,
            restart: idle,
            delete: idle,
        }
    }
}

fn controls(detail: &CvmDetail) -> String {
    let allowed = ActionAvailability::for_detail(detail);
    let button = |action: &str, label: &str, enabled: bool, class: &str| {
        format!(
            r#"<button type="button" class="{class}" data-action="{action}"{}>{label}</button> "#,
            if enabled { "" } else { " disabled" }
        )
    };
    let updating = if detail.in_progress {
        r#"<p class="hint">CVM is updating.</p>"#
    } else {
        ""
    };
    format!(
        r#"<div class="card" id="cvm-actions" data-app-id="{app_id}" data-public-logs="{logs}" data-public-sysinfo="{sysinfo}">
        <h3>Actions</h3>
        <p>{start}{stop}{restart}{delete}</p>
        {updating}
        <form id="visibility-form">
          <label><input type="checkbox" name="public_logs"{logs_checked} /> Public logs</label>
          <label><input type="checkbox" name="public_sysinfo"{sysinfo_checked} /> Public system info</label>
          <p><button type="submit" class="secondary">Save visibility</button></p>
        </form>
        <p id="action-out" class="error"></p>
      </div>"#,
        app_id = escape(&detail.app_id),
        logs = detail.public_logs,
        sysinfo = detail.public_sysinfo,
        start = button("start", "Start", allowed.start, "secondary"),
        stop = button("stop", "Stop", allowed.stop, "secondary"),
        restart = button("restart", "Restart", allowed.restart, "secondary"),
        delete = button("delete", "Delete", allowed.delete, ""),
        logs_checked = checked(detail.public_logs),
        sysinfo_checked = checked(detail.public_sysinfo),
    )
}

/// A polled panel, or the "enable visibility" prompt when the data is private.
fn panel(id: &str, title: &str, app_id: &str, public: bool, unreachable: &str) -> String {
    let kind = if id == "cvm-logs" { "logs" } else { "metrics" };
    if !public {
        let (message, button) = if kind == "logs" {
            ("Logs are private for this CVM.", "Enable log visibility")
        } else {
            ("System metrics are private for this CVM.", "Enable metrics visibility")
        };
        return format!(
            r#"<div class="card"><h3>{title}</h3><p>{message}</p><button type="button" data-enable="{kind}">{button}</button></div>"#
        );
    }
    let loading = if kind == "logs" { "Loading logs..." } else { "Loading metrics..." };
    format!(
        r#"<div class="card" id="{id}" data-src="/dashboard/instances/{src}/{kind}" data-unreachable="{unreachable}">
        <div class="row"><h3>{title}</h3><span><span class="hint" data-role="stamp"></span> <button type="button" class="secondary" data-role="auto">Auto-refresh on</button> <button type="button" class="secondary" data-role="refresh">Refresh</button></span></div>
        <div data-role="body"><p class="hint">{loading}</p></div>
      </div>"#,
        src = escape(&urlencoding::encode(app_id)),
        unreachable = escape(unreachable),
    )
}

/// GET /dashboard/instances/:id
pub async fn instance(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let redirect = format!("/dashboard/instances/{id}");
    let Some(api_key) = cookies.api_key.as_deref() else {
        return layout("Instance", &link_api_key_card("this instance", &redirect));
    };
    let id = normalize_cvm_id(&id);
    match state.cloud(Some(api_key)).get_cvm(&id).await {
        Ok(detail) => {
            let title = detail.name.clone().unwrap_or_else(|| detail.app_id.clone());
            let body = format!(
                "{}{}{}{}<script>{STATE_SCRIPT}{CONTROLS_SCRIPT}</script>",
                instance_detail(&detail),
                controls(&detail),
                panel("cvm-metrics", "Metrics", &detail.app_id, detail.public_sysinfo, STATS_UNREACHABLE),
                panel("cvm-logs", "Console & Logs", &detail.app_id, detail.public_logs, LOGS_UNREACHABLE),
            );
            layout(&title, &body)
        }
        Err(e) => layout("Instance", &error_card(&e.to_string())),
    }
}

// ============================================================================
// Polled fragments
// ============================================================================

fn fragment_error(message: &str) -> String {
    format!(r#"<p class="error">{}</p>"#, escape(message))
}

/// Logs panel body for one fetch of `/cvms/{id}/logs`.
pub fn logs_fragment(fetched: Result<FetchResult>) -> String {
    match fetched {
        Ok(result) if result.ok => {
            let text = tail_lines(&normalize_logs(&result.data), LOG_TAIL_LINES);
            if text.trim().is_empty() {
                r#"<p class="hint">No logs returned yet.</p>"#.to_string()
            } else {
                format!(r#"<pre class="logs">{}</pre>"#, escape(&text))
            }
        }
        Ok(result) => fragment_error(&failure_message(&result.data, LOGS_FAILED)),
        Err(_) => fragment_error(LOGS_UNREACHABLE),
    }
}

fn metric(label: &str, value: &str, percent: f64, helper: &str, series: &str) -> String {
    format!(
        r#"<div>
          <div class="row hint"><span>{label}</span><span>{value}</span></div>
          <div class="bar"><div style="width:{percent:.1}%"></div></div>
          <div class="row"><span class="hint">{helper}</span><svg width="120" height="32" data-series="{series}"></svg></div>
        </div>"#,
        value = escape(value),
        helper = escape(helper),
    )
}

fn sysinfo_grid(sysinfo: &SysInfo) -> String {
    let usage = sysinfo.usage();
    let (disk_total, disk_used) = sysinfo.disk_totals();
    let bytes = |v: f64| format_bytes(Some(v));
    let os = [sysinfo.os_name.as_deref(), sysinfo.os_version.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let usage_json = serde_json::to_string(&usage).unwrap_or_default();

    format!(
        r#"<div class="grid" data-usage="{usage_json}">{cpu}{memory}{disk}
        <div><div class="hint">Uptime</div><div>{uptime}</div><div class="hint">{cpu_model}</div><div class="hint">{os}</div><div class="hint">Kernel {kernel}</div></div>
      </div>"#,
        usage_json = escape(&usage_json),
        cpu = metric(
            "CPU load",
            &format!("{:.2} load", sysinfo.loadavg_one),
            usage.cpu,
            &format!(
                "1m/5m/15m: {:.2} · {:.2} · {:.2}",
                sysinfo.loadavg_one, sysinfo.loadavg_five, sysinfo.loadavg_fifteen
            ),
            "cpu",
        ),
        memory = metric(
            "Memory usage",
            &format!("{} / {}", bytes(sysinfo.used_memory), bytes(sysinfo.total_memory)),
            usage.memory,
            &format!("Free {} · Swap {}", bytes(sysinfo.free_memory), bytes(sysinfo.total_swap)),
            "memory",
        ),
        disk = metric(
            "Disk usage",
            &format!("{} / {}", bytes(disk_used), bytes(disk_total)),
            usage.disk,
            &format!("{} mount(s)", sysinfo.disks.len()),
            "disk",
        ),
        uptime = format_uptime(Some(sysinfo.uptime)),
        cpu_model = or_dash(sysinfo.cpu_model.as_deref()),
        os = escape(&os),
        kernel = or_dash(sysinfo.kernel_version.as_deref()),
    )
}

/// Metrics panel body for one fetch of `/cvms/{id}/stats`.
pub fn metrics_fragment(fetched: Result<FetchResult>) -> String {
    let result = match fetched {
        Ok(result) if result.ok => result,
        Ok(result) => return fragment_error(&failure_message(&result.data, STATS_FAILED)),
        Err(_) => return fragment_error(STATS_UNREACHABLE),
    };
    let stats = CvmStats::from_value(&result.data);
    let mut body = String::new();
    if let Some(boot_error) = &stats.boot_error {
        body.push_str(&fragment_error(boot_error));
    } else if let Some(progress) = stats.boot_progress.as_deref().filter(|_| !stats.is_online) {
        body.push_str(&format!(r#"<p class="hint">Booting: {}</p>"#, escape(progress)));
    }
    match (&stats.sysinfo, &stats.error) {
        (Some(sysinfo), _) => body.push_str(&sysinfo_grid(sysinfo)),
        (None, Some(error)) => body.push_str(&fragment_error(error)),
        (None, None) => body.push_str(r#"<p class="hint">No metrics reported yet.</p>"#),
    }
    body
}

/// GET /dashboard/instances/:id/logs
pub async fn instance_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return Html(fragment_error("API key required"));
    };
    Html(logs_fragment(state.cloud(Some(api_key)).cvm_logs(&id).await))
}

/// GET /dashboard/instances/:id/metrics
pub async fn instance_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return Html(fragment_error("API key required"));
    };
    Html(metrics_fragment(state.cloud(Some(api_key)).cvm_stats(&id).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexis_common::Error;
    use serde_json::json;

    fn ok(data: serde_json::Value) -> Result<FetchResult> {
        Ok(FetchResult { status: 200, ok: true, data })
    }

    fn failed(status: u16, data: serde_json::Value) -> Result<FetchResult> {
        Ok(FetchResult { status, ok: false, data })
    }

    #[test]
    fn test_detail_escapes_upstream_text() {
        let raw = json!({
            "name": "<b>x</b>",
            "status": "running",
            "public_urls": [{"app": "https://a.example/?q=\"1\"", "instance": "<i>"}]
        });
        let detail = CvmDetail::from_value(&raw, "app_abc");
        let html = instance_detail(&detail);
        assert!(html.contains(r#"data-status="running""#));
        assert!(html.contains("&lt;i&gt;"));
        assert!(!html.contains("<i>"));
    }

    #[test]
    fn test_action_availability() {
        let running = CvmDetail::from_value(&json!({"status": "running"}), "app_1");
        let allowed = ActionAvailability::for_detail(&running);
        assert!(!allowed.start && allowed.stop && allowed.restart && allowed.delete);

        let stopped = CvmDetail::from_value(&json!({"status": "stopped"}), "app_1");
        let allowed = ActionAvailability::for_detail(&stopped);
        assert!(allowed.start && !allowed.stop);

        let busy = CvmDetail::from_value(&json!({"status": "running", "in_progress": true}), "app_1");
        let allowed = ActionAvailability::for_detail(&busy);
        assert_eq!(
            allowed,
            ActionAvailability { start: false, stop: false, restart: false, delete: false }
        );
        let html = controls(&busy);
        assert!(html.contains("CVM is updating."));
        assert!(html.contains(r#"data-action="delete" disabled"#));
    }

    #[test]
    fn test_controls_reflect_visibility() {
        let detail = CvmDetail::from_value(&json!({"status": "stopped", "public_logs": true}), "app_1");
        let html = controls(&detail);
        assert!(html.contains(r#"name="public_logs" checked"#));
        assert!(html.contains(r#"name="public_sysinfo" />"#));
        assert!(html.contains(r#"data-action="start">Start"#));
        assert!(html.contains(r#"data-action="stop" disabled>Stop"#));
    }

    #[test]
    fn test_private_panels_offer_enable() {
        let html = panel("cvm-logs", "Console & Logs", "app_1", false, LOGS_UNREACHABLE);
        assert!(html.contains("Logs are private for this CVM."));
        assert!(html.contains(r#"data-enable="logs""#));

        let html = panel("cvm-metrics", "Metrics", "app_1", false, STATS_UNREACHABLE);
        assert!(html.contains("Enable metrics visibility"));

        let html = panel("cvm-logs", "Console & Logs", "app_1", true, LOGS_UNREACHABLE);
        assert!(html.contains(r#"data-src="/dashboard/instances/app_1/logs""#));
    }

    #[test]
    fn test_logs_fragment() {
        assert_eq!(
            logs_fragment(ok(json!({"logs": ["<boot>", "ready"]}))),
            r#"<pre class="logs">&lt;boot&gt;
ready</pre>"#
        );
        assert!(logs_fragment(ok(json!(""))).contains("No logs returned yet."));
        assert!(logs_fragment(failed(403, json!({"error": "Logs are disabled"}))).contains("Logs are disabled"));
        assert!(logs_fragment(failed(500, json!("oops"))).contains(LOGS_FAILED));
        assert!(logs_fragment(Err(Error::Internal("refused".into()))).contains(LOGS_UNREACHABLE));
    }

    #[test]
    fn test_logs_fragment_keeps_tail() {
        let lines: Vec<String> = (0..400).map(|n| format!("line {n}")).collect();
        let html = logs_fragment(ok(json!(lines.join("\n"))));
        assert!(!html.contains("line 99\n"));
        assert!(html.contains("line 100\n"));
        assert!(html.contains("line 399</pre>"));
    }

    #[test]
    fn test_metrics_fragment() {
        let html = metrics_fragment(ok(json!({
            "is_online": true,
            "sysinfo": {
                "num_cpus": 2, "loadavg_one": 0.5, "loadavg_five": 0.25, "loadavg_fifteen": 0.125,
                "total_memory": 4294967296u64, "used_memory": 1073741824u64,
                "free_memory": 3221225472u64, "total_swap": 0,
                "uptime": 3720,
                "disks": [{"total_size": 1000, "free_size": 500}],
                "cpu_model": "Xeon", "os_name": "Ubuntu", "os_version": "24.04", "kernel_version": "6.8"
            }
        })));
        assert!(html.contains("0.50 load"));
        assert!(html.contains("1m/5m/15m: 0.50 · 0.25 · 0.13"));
        assert!(html.contains("1.0 GB / 4.0 GB"));
        assert!(html.contains("Free 3.0 GB · Swap 0 B"));
        assert!(html.contains("1 mount(s)"));
        assert!(html.contains("width:25.0%"));
        assert!(html.contains("width:50.0%"));
        assert!(html.contains("1h 2m"));
        assert!(html.contains("Ubuntu 24.04"));
        assert!(html.contains("Kernel 6.8"));
        assert!(html.contains("data-usage=\"{&quot;cpu&quot;:25.0"));
    }

    #[test]
    fn test_metrics_fragment_errors() {
        assert!(metrics_fragment(failed(502, json!({}))).contains(STATS_FAILED));
        assert!(metrics_fragment(Err(Error::Internal("x".into()))).contains(STATS_UNREACHABLE));
        assert!(metrics_fragment(ok(json!({"is_online": false, "error": "CVM offline"}))).contains("CVM offline"));
        assert!(metrics_fragment(ok(json!({"is_online": false, "boot_progress": "loading"}))).contains("Booting: loading"));
        assert!(metrics_fragment(ok(json!({}))).contains("No metrics reported yet."));
    }
}
