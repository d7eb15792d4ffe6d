//! Console configuration
//!
//! Values come from command-line flags or environment variables, then from an
//! optional TOML file, then from the defaults below.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

use nexis_common::cloud::{DEFAULT_CLOUD_API_URL, DEFAULT_CLOUD_API_VERSION};
use nexis_common::SecretBox;

pub const DEFAULT_SESSION_MAX_AGE: u64 = 60 * 60 * 24 * 7;
pub const DEFAULT_DEVICE_CLIENT_ID: &str = "phala-cli";
pub const DEFAULT_DEVICE_SCOPE: &str = "user:profile cvms:* nodes:*";
pub const DEFAULT_PRIVY_API_URL: &str = "https://auth.privy.io";

/// Console configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Listen address
    pub addr: SocketAddr,

    /// Cloud API base URL
    pub cloud_api_url: String,

    /// Value of the `X-Phala-Version` header
    pub cloud_api_version: String,

    /// Session cookie lifetime in seconds
    pub session_max_age: u64,

    pub device_client_id: String,
    pub device_scope: String,

    /// Optional upstream services
    pub agents_api_url: Option<String>,
    pub billing_api_url: Option<String>,
    pub teams_api_url: Option<String>,
    pub trust_center_api_url: Option<String>,
    pub api_keys_api_url: Option<String>,
    pub usage_api_url: Option<String>,

    /// At-rest key for stored secrets (64 hex chars or base64)
    pub encryption_key: Option<String>,

    pub privy_app_id: Option<String>,
    /// PEM-encoded ES256 verification key
    pub privy_verification_key: Option<String>,
    pub privy_app_secret: Option<String>,
    pub privy_api_url: String,

    /// Root for the local JSON stores
    pub data_dir: PathBuf,

    /// Prebuilt deployment templates
    pub templates_dir: PathBuf,

    /// Serve `/api/keys` from the local store instead of the cloud API
    pub local_api_keys: bool,

    /// Set the `Secure` attribute on cookies
    pub secure_cookies: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            cloud_api_url: DEFAULT_CLOUD_API_URL.to_string(),
            cloud_api_version: DEFAULT_CLOUD_API_VERSION.to_string(),
            session_max_age: DEFAULT_SESSION_MAX_AGE,
            device_client_id: DEFAULT_DEVICE_CLIENT_ID.to_string(),
            device_scope: DEFAULT_DEVICE_SCOPE.to_string(),
            agents_api_url: None,
            billing_api_url: None,
            teams_api_url: None,
            trust_center_api_url: None,
            api_keys_api_url: None,
            usage_api_url: None,
            encryption_key: None,
            privy_app_id: None,
            privy_verification_key: None,
            privy_app_secret: None,
            privy_api_url: DEFAULT_PRIVY_API_URL.to_string(),
            data_dir: nexis_common::default_data_dir(),
            templates_dir: PathBuf::from("../nexis-cloud/templates/prebuilt"),
            local_api_keys: false,
            secure_cookies: false,
        }
    }
}

impl ConsoleConfig {
    /// Load configuration from file, or defaults when the file is absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Secret envelope key, when a valid one is configured
    pub fn secret_box(&self) -> Option<SecretBox> {
        let raw = self.encryption_key.as_deref()?;
        let sealed = SecretBox::from_key_material(raw);
        if sealed.is_none() {
            warn!("NEXIS_CONSOLE_ENCRYPTION_KEY is set but is not a 32-byte key, secrets storage disabled");
        }
        sealed
    }

    /// Privy is usable for session verification
    pub fn privy_configured(&self) -> bool {
        self.privy_app_id.is_some() && self.privy_verification_key.is_some()
    }
}

/// Command-line and environment overrides
#[derive(Parser, Debug, Default)]
#[command(name = "nexis-web")]
#[command(about = "Nexis cloud console server")]
#[command(version)]
pub struct ConsoleArgs {
    /// TOML configuration file
    #[arg(short, long, env = "NEXIS_WEB_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "NEXIS_WEB_ADDR")]
    pub addr: Option<SocketAddr>,

    /// Cloud API base URL (falls back to PHALA_CLOUD_API_PREFIX)
    #[arg(long, env = "NEXIS_CLOUD_API_URL")]
    pub cloud_api_url: Option<String>,

    #[arg(long, env = "NEXIS_CLOUD_API_VERSION")]
    pub cloud_api_version: Option<String>,

    #[arg(long, env = "NEXIS_CLOUD_SESSION_MAX_AGE")]
    pub session_max_age: Option<u64>,

    #[arg(long, env = "NEXIS_CLOUD_DEVICE_CLIENT_ID")]
    pub device_client_id: Option<String>,

    #[arg(long, env = "NEXIS_CLOUD_DEVICE_SCOPE")]
    pub device_scope: Option<String>,

    #[arg(long, env = "NEXIS_AGENTS_API_URL")]
    pub agents_api_url: Option<String>,

    #[arg(long, env = "NEXIS_BILLING_API_URL")]
    pub billing_api_url: Option<String>,

    #[arg(long, env = "NEXIS_TEAMS_API_URL")]
    pub teams_api_url: Option<String>,

    #[arg(long, env = "NEXIS_TRUST_CENTER_API_URL")]
    pub trust_center_api_url: Option<String>,

    #[arg(long, env = "NEXIS_API_KEYS_API_URL")]
    pub api_keys_api_url: Option<String>,

    /// API usage service (falls back to NEXIS_USAGE_API_URL)
    #[arg(long, env = "NEXIS_API_USAGE_URL")]
    pub usage_api_url: Option<String>,

    #[arg(long, env = "NEXIS_CONSOLE_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Privy app id (falls back to NEXT_PUBLIC_PRIVY_APP_ID)
    #[arg(long, env = "PRIVY_APP_ID")]
    pub privy_app_id: Option<String>,

    #[arg(long, env = "PRIVY_VERIFICATION_KEY", hide_env_values = true)]
    pub privy_verification_key: Option<String>,

    #[arg(long, env = "PRIVY_APP_SECRET", hide_env_values = true)]
    pub privy_app_secret: Option<String>,

    #[arg(long, env = "PRIVY_API_URL")]
    pub privy_api_url: Option<String>,

    #[arg(long, env = "NEXIS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "NEXIS_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    #[arg(long, env = "NEXIS_LOCAL_API_KEYS", value_parser = clap::builder::BoolishValueParser::new())]
    pub local_api_keys: Option<bool>,

    #[arg(long, env = "NEXIS_SECURE_COOKIES", value_parser = clap::builder::BoolishValueParser::new())]
    pub secure_cookies: Option<bool>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn env_fallback(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}

impl ConsoleArgs {
    /// Resolve the final configuration
    pub fn into_config(self) -> anyhow::Result<ConsoleConfig> {
        let base = match &self.config {
            Some(path) => ConsoleConfig::load(path)?,
            None => ConsoleConfig::default(),
        };
        Ok(self.apply(base))
    }

    /// Overlay flags and environment values onto `base`
    pub fn apply(self, base: ConsoleConfig) -> ConsoleConfig {
        ConsoleConfig {
            addr: self.addr.unwrap_or(base.addr),
            cloud_api_url: non_empty(self.cloud_api_url)
                .or_else(|| env_fallback("PHALA_CLOUD_API_PREFIX"))
                .unwrap_or(base.cloud_api_url),
            cloud_api_version: non_empty(self.cloud_api_version).unwrap_or(base.cloud_api_version),
            session_max_age: self
                .session_max_age
                .filter(|age| *age > 0)
                .unwrap_or(base.session_max_age),
            device_client_id: non_empty(self.device_client_id).unwrap_or(base.device_client_id),
            device_scope: non_empty(self.device_scope).unwrap_or(base.device_scope),
            agents_api_url: non_empty(self.agents_api_url).or(base.agents_api_url),
            billing_api_url: non_empty(self.billing_api_url).or(base.billing_api_url),
            teams_api_url: non_empty(self.teams_api_url).or(base.teams_api_url),
            trust_center_api_url: non_empty(self.trust_center_api_url).or(base.trust_center_api_url),
            api_keys_api_url: non_empty(self.api_keys_api_url).or(base.api_keys_api_url),
            usage_api_url: non_empty(self.usage_api_url)
                .or_else(|| env_fallback("NEXIS_USAGE_API_URL"))
                .or(base.usage_api_url),
            encryption_key: non_empty(self.encryption_key).or(base.encryption_key),
            privy_app_id: non_empty(self.privy_app_id)
                .or_else(|| env_fallback("NEXT_PUBLIC_PRIVY_APP_ID"))
                .or(base.privy_app_id),
            privy_verification_key: non_empty(self.privy_verification_key).or(base.privy_verification_key),
            privy_app_secret: non_empty(self.privy_app_secret).or(base.privy_app_secret),
            privy_api_url: non_empty(self.privy_api_url).unwrap_or(base.privy_api_url),
            data_dir: self.data_dir.unwrap_or(base.data_dir),
            templates_dir: self.templates_dir.unwrap_or(base.templates_dir),
            local_api_keys: self.local_api_keys.unwrap_or(base.local_api_keys),
            secure_cookies: self.secure_cookies.unwrap_or(base.secure_cookies),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConsoleConfig::default();
        assert_eq!(config.addr.to_string(), "127.0.0.1:3000");
        assert_eq!(config.cloud_api_version, "2025-10-28");
        assert_eq!(config.session_max_age, 604_800);
        assert!(!config.privy_configured());
        assert!(config.secret_box().is_none());
    }

    #[test]
    fn test_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "billing_api_url = \"http://billing.local\"\nsession_max_age = 60\nlocal_api_keys = true"
        )
        .unwrap();

        let base = ConsoleConfig::load(file.path()).unwrap();
        assert_eq!(base.billing_api_url.as_deref(), Some("http://billing.local"));
        assert!(base.local_api_keys);

        let args = ConsoleArgs {
            session_max_age: Some(120),
            billing_api_url: Some("  ".to_string()),
            agents_api_url: Some("http://agents.local".to_string()),
            ..ConsoleArgs::default()
        };
        let config = args.apply(base);
        assert_eq!(config.session_max_age, 120);
        assert_eq!(config.billing_api_url.as_deref(), Some("http://billing.local"));
        assert_eq!(config.agents_api_url.as_deref(), Some("http://agents.local"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ConsoleConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.device_client_id, DEFAULT_DEVICE_CLIENT_ID);
    }
}
