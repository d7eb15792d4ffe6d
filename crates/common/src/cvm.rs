//! CVM (confidential VM) records and display helpers.
//!
//! Records are owned by the cloud API; these types are tolerant views over
//! whatever `/cvms/paginated` and `/cvms/{id}` return.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::json::{self, Object};

/// CVM lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvmStatus {
    Provisioning,
    Running,
    Stopped,
    Error,
    Unknown,
}

impl Default for CvmStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl CvmStatus {
    /// Parse an upstream status string. Never fails.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" | "exited" => Self::Stopped,
            "provisioning" | "starting" | "creating" | "pending" => Self::Provisioning,
            "error" | "failed" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// The state a toggle action should drive towards.
    pub fn toggle_target(self) -> Self {
        if self == Self::Running {
            Self::Stopped
        } else {
            Self::Running
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CvmStatus::Provisioning => "provisioning",
            CvmStatus::Running => "running",
            CvmStatus::Stopped => "stopped",
            CvmStatus::Error => "error",
            CvmStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CvmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle action exposed by `/cvms/{id}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvmAction {
    Start,
    Stop,
    Restart,
}

impl CvmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CvmAction::Start => "start",
            CvmAction::Stop => "stop",
            CvmAction::Restart => "restart",
        }
    }
}

/// Body for `PATCH /cvms/{id}/visibility`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisibilityUpdate {
    pub public_sysinfo: bool,
    pub public_logs: bool,
}

/// Canonicalise a CVM id: keep `app_`/`instance_` ids, prefix bare 40-hex
/// app ids with `app_`.
pub fn normalize_cvm_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("app_") || trimmed.starts_with("instance_") {
        return trimmed.to_string();
    }
    if trimmed.len() == 40 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return format!("app_{trimmed}");
    }
    trimmed.to_string()
}

const MISSING: &str = "—";

pub fn format_memory(mb: Option<f64>) -> String {
    match mb {
        None => MISSING.to_string(),
        Some(v) if v >= 1024.0 => format!("{:.1} GB", v / 1024.0),
        Some(v) => format!("{} MB", trim_float(v)),
    }
}

pub fn format_disk(gb: Option<f64>) -> String {
    match gb {
        None => MISSING.to_string(),
        Some(v) => format!("{} GB", trim_float(v)),
    }
}

pub fn format_bytes(bytes: Option<f64>) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let Some(mut size) = bytes else {
        return MISSING.to_string();
    };
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let precision = if size >= 10.0 || unit == 0 { 0 } else { 1 };
    format!("{:.*} {}", precision, size, UNITS[unit])
}

pub fn format_uptime(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return MISSING.to_string();
    };
    let total = seconds.max(0.0).floor() as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

fn trim_float(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Gateway host and optional port parsed from `host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub host: String,
    pub port: Option<String>,
}

pub fn parse_gateway_domain(gateway_domain: &str) -> GatewayInfo {
    let trimmed = gateway_domain.trim();
    if let Some(idx) = trimmed.rfind(':') {
        let port = &trimmed[idx + 1..];
        if idx > 0 && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return GatewayInfo {
                host: trimmed[..idx].to_string(),
                port: Some(port.to_string()),
            };
        }
    }
    GatewayInfo {
        host: trimmed.to_string(),
        port: None,
    }
}

/// SSH access through the TLS gateway
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SshCommand {
    pub host: String,
    pub port: String,
    pub command: String,
}

pub fn build_ssh_command(instance_id: &str, gateway_domain: &str) -> SshCommand {
    let gateway = parse_gateway_domain(gateway_domain);
    let bare_id = instance_id
        .strip_prefix("app_")
        .or_else(|| instance_id.strip_prefix("instance_"))
        .unwrap_or(instance_id);
    let host = format!("{bare_id}-22.{}", gateway.host);
    let port = gateway.port.unwrap_or_else(|| "443".to_string());
    let command = [
        "ssh",
        "-o",
        "ProxyCommand=openssl s_client -quiet -connect %h:%p 2>/dev/null",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
        "-p",
        &port,
        &format!("root@{host}"),
    ]
    .join(" ");
    SshCommand { host, port, command }
}

/// Public endpoint pair advertised for a CVM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicUrl {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub instance: String,
}

fn public_urls(obj: &Object) -> Vec<PublicUrl> {
    obj.get("public_urls")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn region_of(node: Option<&Value>) -> Option<String> {
    let node = node?.as_object()?;
    json::pick_string(node, &["region_identifier", "name"])
}

/// Row of the instances table
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CvmSummary {
    /// Stable row key; the app id when known.
    pub id: String,
    pub app_id: Option<String>,
    pub name: String,
    pub status: CvmStatus,
    pub region: Option<String>,
    pub vcpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk_size: Option<f64>,
    pub in_progress: bool,
    pub public_urls: Vec<PublicUrl>,
}

impl CvmSummary {
    pub fn from_value(raw: &Value, index: usize) -> Self {
        let empty = Object::new();
        let obj = raw.as_object().unwrap_or(&empty);
        let hosted = obj.get("hosted").and_then(Value::as_object).unwrap_or(&empty);
        let raw_app_id = json::pick_string(hosted, &["app_id", "id"]).unwrap_or_default();
        let app_id = (!raw_app_id.is_empty()).then(|| normalize_cvm_id(&raw_app_id));
        let name = json::pick_string(obj, &["name"]);

        let id = match &app_id {
            Some(id) => id.clone(),
            None => format!(
                "{}-{}",
                name.as_deref().unwrap_or("cvm"),
                index
            ),
        };

        Self {
            id,
            app_id,
            name: name.unwrap_or_else(|| "Unnamed CVM".to_string()),
            status: obj
                .get("status")
                .and_then(Value::as_str)
                .map(CvmStatus::parse)
                .unwrap_or_default(),
            region: region_of(obj.get("node")),
            vcpu: obj.get("vcpu").and_then(json::to_number),
            memory: obj.get("memory").and_then(json::to_number),
            disk_size: obj.get("disk_size").and_then(json::to_number),
            in_progress: obj.get("in_progress").and_then(Value::as_bool).unwrap_or(false),
            public_urls: public_urls(obj),
        }
    }
}

/// One page of `/cvms/paginated`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CvmPage {
    pub items: Vec<CvmSummary>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub pages: u64,
}

impl CvmPage {
    pub fn from_value(raw: &Value, page: u64, page_size: u64) -> Self {
        let items: Vec<CvmSummary> = json::extract_list(raw, &["items", "data"])
            .map(|list| {
                list.iter()
                    .enumerate()
                    .map(|(i, v)| CvmSummary::from_value(v, i))
                    .collect()
            })
            .unwrap_or_default();
        let count = |key: &str| raw.get(key).and_then(Value::as_u64);
        Self {
            total: count("total").unwrap_or(items.len() as u64),
            page: count("page").unwrap_or(page),
            page_size: count("page_size").unwrap_or(page_size),
            pages: count("pages").unwrap_or(1),
            items,
        }
    }
}

/// Detail view of one CVM
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CvmDetail {
    pub app_id: String,
    pub name: Option<String>,
    pub status: CvmStatus,
    pub in_progress: bool,
    pub public_sysinfo: bool,
    pub public_logs: bool,
    pub vm_uuid: Option<String>,
    pub instance_id: Option<String>,
    pub vcpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk_size: Option<f64>,
    pub region: Option<String>,
    pub gateway_domain: Option<String>,
    pub dapp_dashboard_url: Option<String>,
    pub public_urls: Vec<PublicUrl>,
}

impl CvmDetail {
    /// `requested_id` is used when the payload carries no `app_id`.
    pub fn from_value(raw: &Value, requested_id: &str) -> Self {
        let empty = Object::new();
        let obj = raw.as_object().unwrap_or(&empty);
        let text = |key: &str| json::pick_string(obj, &[key]);
        let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);

        Self {
            app_id: normalize_cvm_id(&text("app_id").unwrap_or_else(|| requested_id.to_string())),
            name: text("name"),
            status: text("status")
                .map(|s| CvmStatus::parse(&s))
                .unwrap_or_default(),
            in_progress: flag("in_progress"),
            public_sysinfo: flag("public_sysinfo"),
            public_logs: flag("public_logs"),
            vm_uuid: text("vm_uuid"),
            instance_id: text("instance_id"),
            vcpu: obj.get("vcpu").and_then(json::to_number),
            memory: obj.get("memory").and_then(json::to_number),
            disk_size: obj.get("disk_size").and_then(json::to_number),
            region: region_of(obj.get("teepod")),
            gateway_domain: text("gateway_domain"),
            dapp_dashboard_url: text("dapp_dashboard_url"),
            public_urls: public_urls(obj),
        }
    }

    pub fn ssh(&self) -> Option<SshCommand> {
        self.gateway_domain
            .as_deref()
            .map(|gw| build_ssh_command(&self.app_id, gw))
    }
}

// ============================================================================
// Logs and system stats
// ============================================================================

/// Lines kept from the end of a log payload
pub const LOG_TAIL_LINES: usize = 300;
/// Samples kept for the usage sparklines
pub const STATS_HISTORY: usize = 30;

pub const LOGS_FAILED: &str = "Unable to load logs.";
pub const LOGS_UNREACHABLE: &str = "Unable to reach the logs endpoint.";
pub const STATS_FAILED: &str = "Unable to load CVM stats.";
pub const STATS_UNREACHABLE: &str = "Unable to reach the stats endpoint.";

/// Flatten whatever `/cvms/{id}/logs` returned into text: a string as-is,
/// an array joined by newlines, an object's `logs` or string `data`, else
/// the object pretty-printed.
pub fn normalize_logs(raw: &Value) -> String {
    fn join(items: &[Value]) -> String {
        items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    match raw {
        Value::String(text) => text.clone(),
        Value::Array(items) => join(items),
        Value::Object(obj) => match (obj.get("logs"), obj.get("data")) {
            (Some(Value::String(text)), _) => text.clone(),
            (Some(Value::Array(items)), _) => join(items),
            (_, Some(Value::String(text))) => text.clone(),
            _ => serde_json::to_string_pretty(raw).unwrap_or_default(),
        },
        _ => String::new(),
    }
}

/// The last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    lines[lines.len() - max_lines..].join("\n")
}

/// `error` of a failed upstream payload, else `fallback`.
pub fn failure_message(data: &Value, fallback: &str) -> String {
    data.get("error")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct DiskInfo {
    pub total_size: f64,
    pub free_size: f64,
}

/// Guest metrics reported by the CVM agent
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SysInfo {
    pub num_cpus: f64,
    pub total_memory: f64,
    pub used_memory: f64,
    pub free_memory: f64,
    pub total_swap: f64,
    pub uptime: f64,
    pub loadavg_one: f64,
    pub loadavg_five: f64,
    pub loadavg_fifteen: f64,
    pub disks: Vec<DiskInfo>,
    pub cpu_model: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
}

/// Usage percentages, each clamped to 0..=100
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct UsageSnapshot {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

fn ratio_percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        clamp_percent(part / whole * 100.0)
    } else {
        0.0
    }
}

impl SysInfo {
    fn from_object(obj: &Object) -> Self {
        let num = |key: &str| json::pick_number(obj, &[key]).unwrap_or(0.0);
        let text = |key: &str| json::pick_string(obj, &[key]);
        let disks = obj
            .get("disks")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|disk| DiskInfo {
                        total_size: json::pick_number(disk, &["total_size"]).unwrap_or(0.0),
                        free_size: json::pick_number(disk, &["free_size"]).unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            num_cpus: num("num_cpus"),
            total_memory: num("total_memory"),
            used_memory: num("used_memory"),
            free_memory: num("free_memory"),
            total_swap: num("total_swap"),
            uptime: num("uptime"),
            loadavg_one: num("loadavg_one"),
            loadavg_five: num("loadavg_five"),
            loadavg_fifteen: num("loadavg_fifteen"),
            disks,
            cpu_model: text("cpu_model"),
            os_name: text("os_name"),
            os_version: text("os_version"),
            kernel_version: text("kernel_version"),
        }
    }

    /// Total and used bytes across every mount.
    pub fn disk_totals(&self) -> (f64, f64) {
        self.disks.iter().fold((0.0, 0.0), |(total, used), disk| {
            (total + disk.total_size, used + (disk.total_size - disk.free_size).max(0.0))
        })
    }

    /// CPU is the one-minute load per core.
    pub fn usage(&self) -> UsageSnapshot {
        let (disk_total, disk_used) = self.disk_totals();
        UsageSnapshot {
            cpu: ratio_percent(self.loadavg_one, self.num_cpus),
            memory: ratio_percent(self.used_memory, self.total_memory),
            disk: ratio_percent(disk_used, disk_total),
        }
    }
}

/// Response of `/cvms/{id}/stats`
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CvmStats {
    pub is_online: bool,
    pub is_public: Option<bool>,
    pub error: Option<String>,
    pub status: Option<String>,
    pub in_progress: bool,
    pub boot_progress: Option<String>,
    pub boot_error: Option<String>,
    pub sysinfo: Option<SysInfo>,
}

impl CvmStats {
    pub fn from_value(raw: &Value) -> Self {
        let empty = Object::new();
        let obj = raw.as_object().unwrap_or(&empty);
        let text = |key: &str| json::pick_string(obj, &[key]);
        let flag = |key: &str| obj.get(key).and_then(Value::as_bool);

        Self {
            is_online: flag("is_online").unwrap_or(false),
            is_public: flag("is_public"),
            error: text("error"),
            status: text("status"),
            in_progress: flag("in_progress").unwrap_or(false),
            boot_progress: text("boot_progress"),
            boot_error: text("boot_error"),
            sysinfo: obj
                .get("sysinfo")
                .and_then(Value::as_object)
                .map(SysInfo::from_object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_parse() {
        assert_eq!(CvmStatus::parse(" Running "), CvmStatus::Running);
        assert_eq!(CvmStatus::parse("STOPPED"), CvmStatus::Stopped);
        assert_eq!(CvmStatus::parse("starting"), CvmStatus::Provisioning);
        assert_eq!(CvmStatus::parse("failed"), CvmStatus::Error);
        assert_eq!(CvmStatus::parse("weird"), CvmStatus::Unknown);
        assert_eq!(CvmStatus::Running.toggle_target(), CvmStatus::Stopped);
        assert_eq!(CvmStatus::Unknown.toggle_target(), CvmStatus::Running);
    }

    #[test]
    fn test_normalize_cvm_id() {
        let hex40 = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(normalize_cvm_id(hex40), format!("app_{hex40}"));
        assert_eq!(normalize_cvm_id(" app_xyz "), "app_xyz");
        assert_eq!(normalize_cvm_id("instance_1"), "instance_1");
        assert_eq!(normalize_cvm_id("my-cvm"), "my-cvm");
    }

    #[test]
    fn test_formatters() {
        assert_eq!(format_memory(None), "—");
        assert_eq!(format_memory(Some(512.0)), "512 MB");
        assert_eq!(format_memory(Some(2048.0)), "2.0 GB");
        assert_eq!(format_disk(Some(40.0)), "40 GB");
        assert_eq!(format_bytes(Some(512.0)), "512 B");
        assert_eq!(format_bytes(Some(1536.0)), "1.5 KB");
        assert_eq!(format_bytes(Some(20.0 * 1024.0 * 1024.0)), "20 MB");
        assert_eq!(format_uptime(Some(90_061.0)), "1d 1h");
        assert_eq!(format_uptime(Some(3_720.0)), "1h 2m");
        assert_eq!(format_uptime(Some(0.0)), "0m");
        assert_eq!(format_uptime(None), "—");
    }

    #[test]
    fn test_ssh_command() {
        let ssh = build_ssh_command("app_abc123", "gw.example.com:8443");
        assert_eq!(ssh.host, "abc123-22.gw.example.com");
        assert_eq!(ssh.port, "8443");
        assert!(ssh.command.ends_with("-p 8443 root@abc123-22.gw.example.com"));
        assert!(ssh.command.contains("ProxyCommand=openssl s_client -quiet -connect %h:%p"));

        let default_port = build_ssh_command("instance_9", "gw.example.com");
        assert_eq!(default_port.port, "443");
        assert_eq!(default_port.host, "9-22.gw.example.com");
    }

    #[test]
    fn test_gateway_without_numeric_port() {
        let info = parse_gateway_domain("gw.example.com:abc");
        assert_eq!(info.host, "gw.example.com:abc");
        assert!(info.port.is_none());
    }

    #[test]
    fn test_page_from_value() {
        let hex40 = "0123456789abcdef0123456789abcdef01234567";
        let raw = json!({
            "items": [
                {
                    "hosted": {"app_id": hex40},
                    "name": "web",
                    "status": "Running",
                    "node": {"region_identifier": "us-west"},
                    "vcpu": 2, "memory": 4096, "disk_size": 40,
                    "public_urls": [{"app": "https://a", "instance": "https://i"}]
                },
                {"hosted": null, "status": null}
            ],
            "total": 12, "page": 2, "pages": 3
        });
        let page = CvmPage::from_value(&raw, 2, 20);
        assert_eq!(page.total, 12);
        assert_eq!(page.page_size, 20);
        assert_eq!(page.items.len(), 2);

        let first = &page.items[0];
        assert_eq!(first.app_id.as_deref(), Some(format!("app_{hex40}").as_str()));
        assert_eq!(first.status, CvmStatus::Running);
        assert_eq!(first.region.as_deref(), Some("us-west"));
        assert_eq!(first.public_urls.len(), 1);

        let second = &page.items[1];
        assert_eq!(second.name, "Unnamed CVM");
        assert_eq!(second.id, "cvm-1");
        assert_eq!(second.status, CvmStatus::Unknown);
    }

    #[test]
    fn test_detail_from_value() {
        let raw = json!({
            "name": "api",
            "status": "stopped",
            "public_logs": true,
            "gateway_domain": "gw.example.com",
            "teepod": {"name": "node-7"}
        });
        let detail = CvmDetail::from_value(&raw, "app_42");
        assert_eq!(detail.app_id, "app_42");
        assert_eq!(detail.status, CvmStatus::Stopped);
        assert!(detail.public_logs);
        assert!(!detail.public_sysinfo);
        assert_eq!(detail.region.as_deref(), Some("node-7"));
        assert_eq!(detail.ssh().unwrap().host, "42-22.gw.example.com");
    }

    #[test]
    fn test_normalize_logs_shapes() {
        assert_eq!(normalize_logs(&json!("a\nb")), "a\nb");
        assert_eq!(normalize_logs(&json!(["a", "b"])), "a\nb");
        assert_eq!(normalize_logs(&json!({"logs": "x"})), "x");
        assert_eq!(normalize_logs(&json!({"logs": ["x", "y"], "data": "ignored"})), "x\ny");
        assert_eq!(normalize_logs(&json!({"logs": 5, "data": "from data"})), "from data");
        assert_eq!(normalize_logs(&json!({"other": 1})), "{\n  \"other\": 1\n}");
        assert_eq!(normalize_logs(&json!(null)), "");
        assert_eq!(normalize_logs(&json!(42)), "");
    }

    #[test]
    fn test_tail_lines() {
        let text = (1..=5).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail_lines(&text, 2), "4\n5");
        assert_eq!(tail_lines(&text, 5), text);
        assert_eq!(tail_lines("", LOG_TAIL_LINES), "");
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(failure_message(&json!({"error": "Logs disabled"}), LOGS_FAILED), "Logs disabled");
        assert_eq!(failure_message(&json!({"error": ""}), LOGS_FAILED), LOGS_FAILED);
        assert_eq!(failure_message(&json!("Bad Gateway"), STATS_FAILED), STATS_FAILED);
    }

    #[test]
    fn test_stats_usage() {
        let raw = json!({
            "is_online": true,
            "sysinfo": {
                "num_cpus": 4,
                "loadavg_one": 2.0, "loadavg_five": 1.0, "loadavg_fifteen": 0.5,
                "total_memory": 8192, "used_memory": 2048,
                "disks": [
                    {"total_size": 100, "free_size": 25},
                    {"total_size": 100, "free_size": 125}
                ],
                "os_name": "Ubuntu", "kernel_version": "6.8"
            }
        });
        let stats = CvmStats::from_value(&raw);
        assert!(stats.is_online);
        assert_eq!(stats.is_public, None);
        let sysinfo = stats.sysinfo.unwrap();
        assert_eq!(sysinfo.disk_totals(), (200.0, 75.0));
        let usage = sysinfo.usage();
        assert_eq!(usage.cpu, 50.0);
        assert_eq!(usage.memory, 25.0);
        assert_eq!(usage.disk, 37.5);
        assert_eq!(sysinfo.os_version, None);
    }

    #[test]
    fn test_stats_usage_clamps_and_handles_zero_totals() {
        let raw = json!({"sysinfo": {"num_cpus": 1, "loadavg_one": 3.5, "total_memory": 0, "used_memory": 10}});
        let usage = CvmStats::from_value(&raw).sysinfo.unwrap().usage();
        assert_eq!(usage, UsageSnapshot { cpu: 100.0, memory: 0.0, disk: 0.0 });
        assert!(CvmStats::from_value(&json!({"sysinfo": null})).sysinfo.is_none());
    }
}
