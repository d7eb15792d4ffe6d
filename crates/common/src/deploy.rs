//! Two-phase CVM deployment: provision, then commit.
//!
//! `provision` reserves resources and returns a `compose_hash` plus the key used
//! to seal env vars. `commit` creates the CVM. A [`CommitRequest`] can only be
//! built from a provision response carrying a compose hash.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub const DEFAULT_PORTS: &str = "80,443";

/// Split on commas and newlines, trimming and dropping empties.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split([',', '\n'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Leading integer of a form field, if any.
pub fn parse_optional_number(value: &str) -> Option<u64> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Valid TCP ports (1..=65535), deduplicated, first occurrence order kept.
pub fn parse_ports(value: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for item in parse_list(value) {
        let Some(port) = parse_optional_number(&item) else {
            continue;
        };
        if (1..=65535).contains(&port) {
            let port = port as u16;
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Minimal compose file exposing `ports` on an nginx container.
pub fn build_compose_template(ports: &[u16]) -> String {
    let resolved: &[u16] = if ports.is_empty() { &[80] } else { ports };
    let port_lines: Vec<String> = resolved
        .iter()
        .map(|port| format!("      - \"{port}:{port}\""))
        .collect();

    [
        "version: \"3.8\"".to_string(),
        "services:".to_string(),
        "  app:".to_string(),
        "    image: nginx:latest".to_string(),
        "    ports:".to_string(),
        port_lines.join("\n"),
        String::new(),
    ]
    .join("\n")
}

/// Pre-launch script installing `keys` as authorized SSH keys.
pub fn build_ssh_pre_launch_script(keys: &[String]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let joined = keys.join("\n");
    [
        "#!/usr/bin/env bash",
        "set -euo pipefail",
        "USER_HOME=\"/root\"",
        "if [ -d \"/home/ubuntu\" ]; then USER_HOME=\"/home/ubuntu\"; fi",
        "SSH_DIR=\"${USER_HOME}/.ssh\"",
        "mkdir -p \"${SSH_DIR}\"",
        "chmod 700 \"${SSH_DIR}\"",
        "cat <<'EOF' > \"${SSH_DIR}/authorized_keys\"",
        joined.as_str(),
        "EOF",
        "chmod 600 \"${SSH_DIR}/authorized_keys\"",
        "if command -v sshd >/dev/null 2>&1; then",
        "  if [ -f /etc/ssh/sshd_config ] && ! grep -q '^PermitRootLogin' /etc/ssh/sshd_config; then",
        "    echo 'PermitRootLogin prohibit-password' >> /etc/ssh/sshd_config",
        "  fi",
        "  if command -v systemctl >/dev/null 2>&1; then",
        "    systemctl enable ssh || true",
        "    systemctl restart ssh || systemctl restart sshd || true",
        "  elif command -v service >/dev/null 2>&1; then",
        "    service ssh restart || service sshd restart || true",
        "  fi",
        "fi",
        "",
    ]
    .join("\n")
}

/// OS image offered by a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeepodImage {
    pub name: String,
    #[serde(default)]
    pub is_dev: Option<bool>,
    #[serde(default)]
    pub version: Option<Vec<u64>>,
    #[serde(default)]
    pub os_image_hash: Option<String>,
}

/// Compute node ("teepod") available for deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeepodNode {
    pub teepod_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region_identifier: Option<String>,
    #[serde(default)]
    pub remaining_vcpu: Option<f64>,
    #[serde(default)]
    pub remaining_memory: Option<f64>,
    #[serde(default)]
    pub remaining_cvm_slots: Option<f64>,
    #[serde(default)]
    pub support_onchain_kms: Option<bool>,
    #[serde(default)]
    pub listed: Option<bool>,
    #[serde(default)]
    pub images: Option<Vec<TeepodImage>>,
}

impl TeepodNode {
    pub fn requires_onchain_kms(&self) -> bool {
        self.support_onchain_kms.unwrap_or(false)
    }
}

/// `GET /teepods/available`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeepodsResponse {
    #[serde(default)]
    pub nodes: Option<Vec<TeepodNode>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vcpu: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub hourly_rate: Option<String>,
    #[serde(default)]
    pub requires_gpu: Option<bool>,
    #[serde(default)]
    pub default_disk_size_gb: Option<u64>,
    #[serde(default)]
    pub family: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceTypeGroup {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<InstanceType>>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// `GET /instance-types`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceTypesResponse {
    #[serde(default)]
    pub result: Option<Vec<InstanceTypeGroup>>,
}

/// Flatten grouped instance types, defaulting `family` to the group name.
pub fn flatten_instance_types(groups: Vec<InstanceTypeGroup>) -> Vec<InstanceType> {
    groups
        .into_iter()
        .flat_map(|group| {
            let family = group.name;
            group.items.unwrap_or_default().into_iter().map(move |mut item| {
                if item.family.is_none() {
                    item.family = family.clone();
                }
                item
            })
        })
        .collect()
}

/// First node with built-in KMS, else the first node.
pub fn default_node(nodes: &[TeepodNode]) -> Option<&TeepodNode> {
    nodes
        .iter()
        .find(|node| !node.requires_onchain_kms())
        .or_else(|| nodes.first())
}

/// Images of the selected node, or the union (by name) across all nodes.
pub fn available_images<'a>(
    nodes: &'a [TeepodNode],
    selected: Option<&'a TeepodNode>,
) -> Vec<&'a TeepodImage> {
    if let Some(images) = selected.and_then(|node| node.images.as_ref()) {
        if !images.is_empty() {
            return images.iter().collect();
        }
    }
    let mut unique: Vec<&TeepodImage> = Vec::new();
    for image in nodes.iter().flat_map(|n| n.images.iter().flatten()) {
        if !unique.iter().any(|seen| seen.name == image.name) {
            unique.push(image);
        }
    }
    unique
}

/// Deployment form state. Missing fields take their [`Default`] values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployDraft {
    pub name: String,
    pub node_id: String,
    pub image: String,
    pub instance_type: String,
    pub vcpu: String,
    pub memory: String,
    pub disk_size: String,
    pub listed: bool,
    pub gateway_enabled: bool,
    pub public_logs: bool,
    pub public_sysinfo: bool,
    pub env_keys: String,
    pub encrypted_env: String,
    pub ssh_keys: String,
    pub open_ports: String,
    pub docker_compose: String,
    pub pre_launch_script: String,
}

impl Default for DeployDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            node_id: String::new(),
            image: String::new(),
            instance_type: String::new(),
            vcpu: String::new(),
            memory: String::new(),
            disk_size: String::new(),
            listed: true,
            gateway_enabled: true,
            public_logs: true,
            public_sysinfo: true,
            env_keys: String::new(),
            encrypted_env: String::new(),
            ssh_keys: String::new(),
            open_ports: DEFAULT_PORTS.to_string(),
            docker_compose: build_compose_template(&parse_ports(DEFAULT_PORTS)),
            pre_launch_script: String::new(),
        }
    }
}

impl DeployDraft {
    pub fn validate(&self, selected_node: Option<&TeepodNode>) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("Deployment name is required."));
        }
        if self.docker_compose.trim().is_empty() {
            return Err(Error::validation("Docker Compose file is required."));
        }
        if selected_node.is_some_and(TeepodNode::requires_onchain_kms) {
            return Err(Error::validation(
                "Selected node requires on-chain KMS. Use a built-in KMS node to deploy from the console.",
            ));
        }
        Ok(())
    }

    /// Regenerate the compose file from `open_ports`.
    pub fn apply_ports(&mut self) {
        self.docker_compose = build_compose_template(&parse_ports(&self.open_ports));
    }

    /// Regenerate the pre-launch script from `ssh_keys`.
    pub fn apply_ssh_keys(&mut self) {
        self.pre_launch_script = build_ssh_pre_launch_script(&parse_list(&self.ssh_keys));
    }

    pub fn env_key_list(&self) -> Option<Vec<String>> {
        let keys = parse_list(&self.env_keys);
        (!keys.is_empty()).then_some(keys)
    }

    /// Selected node id, when the form holds a number.
    pub fn teepod_id(&self) -> Option<u64> {
        parse_optional_number(&self.node_id)
    }

    /// The listed node matching `node_id`. A manual id may match nothing.
    pub fn selected_node<'a>(&self, nodes: &'a [TeepodNode]) -> Option<&'a TeepodNode> {
        let id = self.teepod_id()?;
        nodes.iter().find(|node| node.teepod_id == id)
    }

    /// Fill blank choices from the available options: the default node, its
    /// first image (also replacing an image the node does not offer), the
    /// first instance type, and that type's default disk size.
    pub fn apply_defaults(&mut self, nodes: &[TeepodNode], instance_types: &[InstanceType]) {
        if self.node_id.is_empty() {
            if let Some(node) = default_node(nodes) {
                self.node_id = node.teepod_id.to_string();
            }
        }

        let images = available_images(nodes, self.selected_node(nodes));
        if !images.iter().any(|image| image.name == self.image) {
            if let Some(first) = images.first() {
                self.image = first.name.clone();
            }
        }

        if self.instance_type.is_empty() {
            if let Some(first) = instance_types.first() {
                self.instance_type = first.id.clone();
            }
        }

        if self.disk_size.is_empty() || self.disk_size == "0" {
            let disk = instance_types
                .iter()
                .find(|kind| kind.id == self.instance_type)
                .and_then(|kind| kind.default_disk_size_gb);
            if let Some(disk) = disk {
                self.disk_size = disk.to_string();
            }
        }
    }

    /// Start from a template: its name when none is set, its compose file
    /// over a blank or untouched default one.
    pub fn apply_template(&mut self, name: &str, compose: Option<&str>) {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        let untouched = self.docker_compose.trim().is_empty()
            || self.docker_compose == build_compose_template(&parse_ports(DEFAULT_PORTS));
        if let Some(compose) = compose.filter(|_| untouched) {
            self.docker_compose = compose.to_string();
        }
    }

    pub fn provision_request(&self) -> ProvisionRequest {
        let name = self.name.trim().to_string();
        let env_keys = self.env_key_list();
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        ProvisionRequest {
            name: name.clone(),
            image: non_empty(&self.image),
            instance_type: non_empty(&self.instance_type),
            vcpu: parse_optional_number(&self.vcpu),
            memory: parse_optional_number(&self.memory),
            disk_size: parse_optional_number(&self.disk_size),
            teepod_id: self.teepod_id(),
            listed: self.listed,
            env_keys: env_keys.clone(),
            compose_file: ComposeFile {
                docker_compose_file: self.docker_compose.clone(),
                pre_launch_script: non_empty(&self.pre_launch_script),
                allowed_envs: env_keys,
                name,
                gateway_enabled: self.gateway_enabled,
                public_logs: self.public_logs,
                public_sysinfo: self.public_sysinfo,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposeFile {
    pub docker_compose_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_launch_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_envs: Option<Vec<String>>,
    pub name: String,
    pub gateway_enabled: bool,
    pub public_logs: bool,
    pub public_sysinfo: bool,
}

/// `POST /cvms/provision`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teepod_id: Option<u64>,
    pub listed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_keys: Option<Vec<String>>,
    pub compose_file: ComposeFile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KmsInfo {
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub kms_url: Option<String>,
    #[serde(default)]
    pub kms_contract_address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvisionResponse {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub compose_hash: Option<String>,
    #[serde(default)]
    pub app_env_encrypt_pubkey: Option<String>,
    #[serde(default)]
    pub os_image_hash: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub kms_info: Option<KmsInfo>,
}

const MISSING_COMPOSE_HASH: &str = "Provision resources before deploying.";
const MISSING_APP_ID: &str =
    "Provision returned no app_id. On-chain KMS deployments require manual app auth.";

/// `POST /cvms`. Only constructible from a provision result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommitRequest {
    app_id: String,
    compose_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    encrypted_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env_keys: Option<Vec<String>>,
}

impl CommitRequest {
    pub fn from_provision(
        provision: &ProvisionResponse,
        encrypted_env: Option<String>,
        env_keys: Option<Vec<String>>,
    ) -> Result<Self> {
        let compose_hash = provision
            .compose_hash
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::validation(MISSING_COMPOSE_HASH))?;
        let app_id = provision
            .app_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::validation(MISSING_APP_ID))?;

        Ok(Self {
            app_id: app_id.to_string(),
            compose_hash: compose_hash.to_string(),
            encrypted_env: encrypted_env.filter(|e| !e.is_empty()),
            env_keys: env_keys.filter(|k| !k.is_empty()),
        })
    }

    /// Same guard applied to a raw JSON commit body.
    pub fn validate_json(body: &Value) -> Result<()> {
        let field = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty())
        };
        if !field("compose_hash") {
            return Err(Error::validation(MISSING_COMPOSE_HASH));
        }
        if !field("app_id") {
            return Err(Error::validation(MISSING_APP_ID));
        }
        Ok(())
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn compose_hash(&self) -> &str {
        &self.compose_hash
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommitResponse {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub vm_uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}
