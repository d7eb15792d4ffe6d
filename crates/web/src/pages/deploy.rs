//! Deploy wizard.
//!
//! The page is rendered with the live node and instance type options and a
//! draft filled from defaults (and a template, when one is named). The
//! browser keeps the draft in local storage, provisions through
//! `/api/deploy/provision`, seals env vars to the returned key and commits
//! through `/api/cvms`.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Html,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use nexis_common::deploy::{available_images, DeployDraft, InstanceType, TeepodNode};

use super::{checked, error_card, escape, layout, link_api_key_card, number};
use crate::auth::SessionCookies;
use crate::server::AppState;
use crate::services::templates::load_template;

#[derive(Debug, Default, Deserialize)]
pub struct DeployQuery {
    pub template: Option<String>,
}

const STEPS: [&str; 4] = ["Image", "Configuration", "Network & Security", "Review"];

const DEPLOY_SCRIPT: &str = r#"
      (function () {
        const form = document.getElementById('deploy-form');
        if (!form) return;
        const KEY = 'nexis_deploy_draft_v2';
        const out = document.getElementById('deploy-out');
        const note = document.getElementById('deploy-note');
        const sections = Array.from(form.querySelectorAll('section[data-step]'));
        const tabs = Array.from(document.querySelectorAll('.steps span'));
        const commitButton = document.getElementById('deploy-commit');
        let provisioned = null;
        let encryptedEnv = '';

        function fields() {
          return Array.from(form.elements).filter((el) => el.name && el.name !== 'env_text');
        }
        function parseEnv(text) {
          const env = {};
          const invalid = [];
          text.split('\n').forEach((line) => {
            const t = line.trim();
            if (!t || t.startsWith('#')) return;
            const i = t.indexOf('=');
            const key = i > 0 ? t.slice(0, i).trim() : '';
            if (!key) { invalid.push(t); return; }
            env[key] = t.slice(i + 1).trim();
          });
          return { env, invalid };
        }
        function draft() {
          const d = {};
          fields().forEach((el) => { d[el.name] = el.type === 'checkbox' ? el.checked : el.value; });
          d.env_keys = Object.keys(parseEnv(form.elements.env_text.value).env).join(',');
          return d;
        }
        function save() {
          try { localStorage.setItem(KEY, JSON.stringify(draft())); } catch (_) {}
        }
        function restore() {
          let saved = null;
          try { saved = JSON.parse(localStorage.getItem(KEY) || 'null'); } catch (_) {}
          if (!saved) return;
          fields().forEach((el) => {
            if (!(el.name in saved)) return;
            const value = saved[el.name];
            if (el.type === 'checkbox') { el.checked = !!value; return; }
            if (el.tagName === 'SELECT' && !Array.from(el.options).some((o) => o.value === value)) return;
            el.value = value;
          });
        }

        function syncImages() {
          const node = form.elements.node_id;
          const image = form.elements.image;
          if (node.tagName !== 'SELECT' || image.tagName !== 'SELECT') return;
          const option = node.options[node.selectedIndex];
          const names = option ? JSON.parse(option.dataset.images || '[]') : [];
          if (!names.length) return;
          const current = image.value;
          image.innerHTML = '';
          names.forEach((name) => image.add(new Option(name, name)));
          image.value = names.includes(current) ? current : names[0];
        }
        function syncDisk() {
          const kind = form.elements.instance_type;
          if (kind.tagName !== 'SELECT') return;
          const option = kind.options[kind.selectedIndex];
          if (option && option.dataset.disk) form.elements.disk_size.value = option.dataset.disk;
        }

        function review() {
          const d = draft();
          const node = form.elements.node_id;
          const nodeLabel = node.tagName === 'SELECT' && node.selectedIndex >= 0 ? node.options[node.selectedIndex].text : d.node_id;
          document.getElementById('deploy-review').textContent = [
            'Name: ' + d.name,
            'Node: ' + (nodeLabel || 'auto'),
            'Image: ' + (d.image || 'default'),
            'Instance type: ' + (d.instance_type || 'custom'),
            'Resources: ' + [d.vcpu && d.vcpu + ' vCPU', d.memory && d.memory + ' MB', d.disk_size && d.disk_size + ' GB'].filter(Boolean).join(' · '),
            'Ports: ' + d.open_ports,
            'Env keys: ' + (d.env_keys || 'none'),
            'Listed: ' + d.listed + ' · Gateway: ' + d.gateway_enabled,
            'Public logs: ' + d.public_logs + ' · Public sysinfo: ' + d.public_sysinfo,
          ].join('\n');
        }
        function show(n) {
          const step = Math.max(0, Math.min(sections.length - 1, n));
          sections.forEach((section, i) => { section.hidden = i !== step; });
          tabs.forEach((tab, i) => { tab.style.fontWeight = i === step ? '700' : '400'; });
          form.dataset.step = step;
          if (step === sections.length - 1) review();
        }

        function keyBytes(text) {
          const t = text.trim();
          if (/^[0-9a-fA-F]{64}$/.test(t)) return Uint8Array.from(t.match(/../g).map((h) => parseInt(h, 16)));
          const b64 = t.replace(/-/g, '+').replace(/_/g, '/').replace(/=+$/, '');
          const bin = atob(b64 + '='.repeat((4 - (b64.length % 4)) % 4));
          return Uint8Array.from(bin, (c) => c.charCodeAt(0));
        }
        function hex(bytes) {
          return Array.from(bytes, (b) => b.toString(16).padStart(2, '0')).join('');
        }
        async function sealEnv(env, publicKey) {
          const subtle = window.crypto.subtle;
          const vmKey = await subtle.importKey('raw', keyBytes(publicKey), { name: 'X25519' }, false, []);
          const eph = await subtle.generateKey({ name: 'X25519' }, true, ['deriveBits']);
          const shared = await subtle.deriveBits({ name: 'X25519', public: vmKey }, eph.privateKey, 256);
          const ephPub = new Uint8Array(await subtle.exportKey('raw', eph.publicKey));
          const aes = await subtle.importKey('raw', shared, { name: 'AES-GCM' }, false, ['encrypt']);
          const nonce = window.crypto.getRandomValues(new Uint8Array(12));
          const plaintext = new TextEncoder().encode(JSON.stringify({ env }));
          const sealed = new Uint8Array(await subtle.encrypt({ name: 'AES-GCM', iv: nonce, additionalData: ephPub }, aes, plaintext));
          const payload = new Uint8Array(ephPub.length + nonce.length + sealed.length);
          payload.set(ephPub, 0);
          payload.set(nonce, ephPub.length);
          payload.set(sealed, ephPub.length + nonce.length);
          return hex(payload);
        }

        async function encrypt() {
          out.textContent = '';
          if (!provisioned || !provisioned.app_env_encrypt_pubkey) {
            out.textContent = 'Provision first to obtain the encryption public key.';
            return false;
          }
          const { env, invalid } = parseEnv(form.elements.env_text.value);
          if (invalid.length) { out.textContent = 'Invalid env entries: ' + invalid.join(', '); return false; }
          if (!Object.keys(env).length) { out.textContent = 'Add at least one KEY=VALUE pair to encrypt.'; return false; }
          try {
            encryptedEnv = await sealEnv(env, provisioned.app_env_encrypt_pubkey);
          } catch (_) {
            out.textContent = 'Unable to encrypt env vars in this browser.';
            return false;
          }
          note.textContent = 'Encrypted ' + Object.keys(env).length + ' env var(s).';
          return true;
        }

        async function provision() {
          out.textContent = '';
          const { invalid } = parseEnv(form.elements.env_text.value);
          if (invalid.length) { out.textContent = 'Invalid env entries: ' + invalid.join(', '); return; }
          save();
          const r = await api('POST', '/api/deploy/provision', draft());
          if (!r.ok) { out.textContent = r.data.error || 'Unable to provision resources.'; return; }
          provisioned = r.data;
          encryptedEnv = '';
          commitButton.disabled = false;
          note.textContent = 'Provisioned resources. Ready to deploy.';
        }

        async function commit() {
          out.textContent = '';
          const { env } = parseEnv(form.elements.env_text.value);
          const keys = Object.keys(env);
          if (keys.length && !encryptedEnv && !(await encrypt())) return;
          const body = Object.assign({}, provisioned || {});
          if (encryptedEnv) { body.encrypted_env = encryptedEnv; body.env_keys = keys; }
          const r = await api('POST', '/api/cvms', {
            app_id: body.app_id,
            compose_hash: body.compose_hash,
            encrypted_env: body.encrypted_env,
            env_keys: body.env_keys,
          });
          if (!r.ok) { out.textContent = r.data.error || 'Unable to deploy.'; return; }
          try { localStorage.removeItem(KEY); } catch (_) {}
          const appId = (r.data && (r.data.app_id || r.data.id)) || body.app_id;
          note.textContent = 'Deployment requested. CVM is provisioning. ';
          if (appId) {
            const link = document.createElement('a');
            link.href = '/dashboard/instances/' + encodeURIComponent(appId);
            link.textContent = 'Open instance';
            note.appendChild(link);
          }
        }

        document.getElementById('apply-ports').addEventListener('click', async () => {
          const r = await api('GET', '/api/deploy/compose?ports=' + encodeURIComponent(form.elements.open_ports.value));
          if (!r.ok) return;
          form.elements.open_ports.value = r.data.open_ports;
          form.elements.docker_compose.value = r.data.docker_compose;
          save();
        });
        form.querySelectorAll('button[data-go]').forEach((button) => {
          button.addEventListener('click', () => show(Number(form.dataset.step) + Number(button.dataset.go)));
        });
        tabs.forEach((tab, i) => tab.addEventListener('click', () => show(i)));
        document.getElementById('deploy-provision').addEventListener('click', provision);
        document.getElementById('deploy-encrypt').addEventListener('click', encrypt);
        commitButton.addEventListener('click', commit);
        form.addEventListener('change', (event) => {
          if (event.target.name === 'node_id') syncImages();
          if (event.target.name === 'instance_type') syncDisk();
          if (event.target.name === 'env_text') encryptedEnv = '';
          save();
        });
        form.addEventListener('submit', (event) => event.preventDefault());

        if (!form.dataset.template) restore();
        syncImages();
        show(0);
      })();
"#;

/// `{name} (ID {id}) · {KMS} · {vCPU} vCPU • {memory} MB`
pub fn node_label(node: &TeepodNode) -> String {
    let name = node.name.as_deref().unwrap_or("Node");
    let kms = if node.requires_onchain_kms() {
        "On-chain KMS"
    } else {
        "Built-in KMS"
    };
    let mut label = format!("{name} (ID {})", node.teepod_id);
    if let Some(region) = node.region_identifier.as_deref() {
        label.push_str(&format!(" · {region}"));
    }
    label.push_str(&format!(" · {kms}"));
    if node.remaining_vcpu.is_some() || node.remaining_memory.is_some() {
        label.push_str(&format!(
            " · {} vCPU • {} MB",
            number(node.remaining_vcpu),
            number(node.remaining_memory)
        ));
    }
    label
}

fn instance_type_label(kind: &InstanceType) -> String {
    let mut label = kind.name.clone();
    if let Some(vcpu) = kind.vcpu {
        label.push_str(&format!(" · {vcpu} vCPU"));
    }
    if let Some(memory) = kind.memory_mb {
        label.push_str(&format!(" · {memory} MB"));
    }
    if let Some(rate) = kind.hourly_rate.as_deref() {
        label.push_str(&format!(" · ${rate}/h"));
    }
    label
}

fn selected(on: bool) -> &'static str {
    if on {
        " selected"
    } else {
        ""
    }
}

fn text_input(name: &str, value: &str, placeholder: &str) -> String {
    format!(
        r#"<input name="{name}" value="{}" placeholder="{}" />"#,
        escape(value),
        escape(placeholder)
    )
}

fn node_field(draft: &DeployDraft, nodes: &[TeepodNode]) -> String {
    if nodes.is_empty() {
        return text_input("node_id", &draft.node_id, "Node ID");
    }
    let options: String = nodes
        .iter()
        .map(|node| {
            let images: Vec<&str> = available_images(nodes, Some(node))
                .into_iter()
                .map(|image| image.name.as_str())
                .collect();
            let images = serde_json::to_string(&images).unwrap_or_default();
            let id = node.teepod_id.to_string();
            format!(
                r#"<option value="{id}" data-images="{}"{}>{}</option>"#,
                escape(&images),
                selected(id == draft.node_id),
                escape(&node_label(node)),
            )
        })
        .collect();
    format!(r#"<select name="node_id">{options}</select>"#)
}

fn image_field(draft: &DeployDraft, nodes: &[TeepodNode]) -> String {
    let images = available_images(nodes, draft.selected_node(nodes));
    if images.is_empty() {
        return text_input("image", &draft.image, "Image name");
    }
    let options: String = images
        .iter()
        .map(|image| {
            format!(
                r#"<option value="{name}"{}>{name}</option>"#,
                selected(image.name == draft.image),
                name = escape(&image.name),
            )
        })
        .collect();
    format!(r#"<select name="image">{options}</select>"#)
}

fn instance_type_field(draft: &DeployDraft, instance_types: &[InstanceType]) -> String {
    if instance_types.is_empty() {
        return text_input("instance_type", &draft.instance_type, "Instance type");
    }
    let options: String = instance_types
        .iter()
        .map(|kind| {
            let disk = kind
                .default_disk_size_gb
                .map(|gb| format!(r#" data-disk="{gb}""#))
                .unwrap_or_default();
            format!(
                r#"<option value="{}"{disk}{}>{}</option>"#,
                escape(&kind.id),
                selected(kind.id == draft.instance_type),
                escape(&instance_type_label(kind)),
            )
        })
        .collect();
    format!(r#"<select name="instance_type">{options}</select>"#)
}

/// The four wizard steps over `draft`.
pub fn wizard(draft: &DeployDraft, nodes: &[TeepodNode], instance_types: &[InstanceType], template: Option<&str>) -> String {
    let tabs: String = STEPS
        .iter()
        .enumerate()
        .map(|(i, step)| format!("<span>{}. {}</span>", i + 1, escape(step)))
        .collect();
    let back = r#"<button type="button" class="secondary" data-go="-1">Back</button> "#;
    let next = r#"<button type="button" data-go="1">Next</button>"#;

    format!(
        r#"<p class="steps">{tabs}</p>
      <form id="deploy-form" class="card" data-template="{template}">
        <section data-step="image">
          <h3>Image</h3>
          <label>Node</label>{node}
          <label>OS image</label>{image}
          <p>{next}</p>
        </section>
        <section data-step="configuration" hidden>
          <h3>Configuration</h3>
          <label>Name</label>{name}
          <label>Instance type</label>{instance_type}
          <div class="grid">
            <div><label>vCPU</label>{vcpu}</div>
            <div><label>Memory (MB)</label>{memory}</div>
            <div><label>Disk (GB)</label>{disk}</div>
          </div>
          <label>Open ports</label>{ports} <button type="button" class="secondary" id="apply-ports">Apply ports</button>
          <label>Docker Compose</label><textarea name="docker_compose">{compose}</textarea>
          <p>{back}{next}</p>
        </section>
        <section data-step="network" hidden>
          <h3>Network &amp; Security</h3>
          <label><input type="checkbox" name="listed"{listed} /> List publicly</label>
          <label><input type="checkbox" name="gateway_enabled"{gateway} /> Enable gateway</label>
          <label><input type="checkbox" name="public_logs"{logs} /> Public logs</label>
          <label><input type="checkbox" name="public_sysinfo"{sysinfo} /> Public system info</label>
          <label>SSH public keys</label><textarea name="ssh_keys" placeholder="ssh-ed25519 AAAA...">{ssh_keys}</textarea>
          <label>Pre-launch script</label><textarea name="pre_launch_script">{script}</textarea>
          <label>Environment variables</label><textarea name="env_text" placeholder="KEY=VALUE"></textarea>
          <p class="hint">Values are encrypted in this browser and never stored.</p>
          <p>{back}{next}</p>
        </section>
        <section data-step="review" hidden>
          <h3>Review</h3>
          <pre id="deploy-review"></pre>
          <p>{back}<button type="button" id="deploy-provision">Provision</button> <button type="button" class="secondary" id="deploy-encrypt">Encrypt env</button> <button type="button" id="deploy-commit" disabled>Deploy</button></p>
        </section>
        <p id="deploy-note" class="hint"></p>
        <p id="deploy-out" class="error"></p>
      </form>"#,
        template = escape(template.unwrap_or("")),
        node = node_field(draft, nodes),
        image = image_field(draft, nodes),
        name = text_input("name", &draft.name, "my-app"),
        instance_type = instance_type_field(draft, instance_types),
        vcpu = text_input("vcpu", &draft.vcpu, "auto"),
        memory = text_input("memory", &draft.memory, "auto"),
        disk = text_input("disk_size", &draft.disk_size, "auto"),
        ports = text_input("open_ports", &draft.open_ports, "80,443"),
        compose = escape(&draft.docker_compose),
        listed = checked(draft.listed),
        gateway = checked(draft.gateway_enabled),
        logs = checked(draft.public_logs),
        sysinfo = checked(draft.public_sysinfo),
        ssh_keys = escape(&draft.ssh_keys),
        script = escape(&draft.pre_launch_script),
    )
}

/// GET /dashboard/deploy
pub async fn deploy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeployQuery>,
) -> Html<String> {
    let cookies = SessionCookies::from_headers(&headers);
    let Some(api_key) = cookies.api_key.as_deref() else {
        return layout("Deploy", &link_api_key_card("deployments", "/dashboard/deploy"));
    };

    let cloud = state.cloud(Some(api_key));
    let (nodes, instance_types) = tokio::join!(cloud.available_nodes(), cloud.instance_types());
    let mut options_error = None;
    let nodes = nodes.unwrap_or_else(|e| {
        warn!(error = %e, "Node list unavailable");
        options_error = Some(e.to_string());
        Vec::new()
    });
    let instance_types = match instance_types {
        Ok(types) => types,
        Err(e) => {
            warn!(error = %e, "Instance types unavailable");
            options_error.get_or_insert_with(|| e.to_string());
            Vec::new()
        }
    };

    let mut body = String::new();
    if let Some(error) = options_error {
        body.push_str(&error_card(&format!("{error} You can still deploy with manual inputs.")));
    }

    let mut draft = DeployDraft::default();
    let slug = query.template.as_deref().map(str::trim).filter(|slug| !slug.is_empty());
    if let Some(slug) = slug {
        match load_template(&state.config.templates_dir, slug).await {
            Some(template) => {
                debug!(slug, "Deploying from template");
                draft.apply_template(&template.name, template.docker_compose.as_deref());
            }
            None => body.push_str(&error_card(&format!("Template {slug} not found."))),
        }
    }
    draft.apply_defaults(&nodes, &instance_types);

    body.push_str(&wizard(&draft, &nodes, &instance_types, slug));
    body.push_str(&format!("<script>{DEPLOY_SCRIPT}</script>"));
    layout("Deploy", &body)
}
