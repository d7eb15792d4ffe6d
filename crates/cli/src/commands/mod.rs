//! CLI Commands

pub mod cvm;
pub mod deploy;
pub mod keys;
pub mod watch;

use anyhow::{bail, Result};
use clap::Args;

use nexis_common::cloud::{DEFAULT_CLOUD_API_URL, DEFAULT_CLOUD_API_VERSION};
use nexis_common::CloudClient;

/// Cloud API connection flags shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct CloudArgs {
    /// Cloud API base URL
    #[arg(long, env = "NEXIS_CLOUD_API_URL", default_value = DEFAULT_CLOUD_API_URL, global = true)]
    pub api_url: String,

    /// Value of the API version header
    #[arg(long, env = "NEXIS_CLOUD_API_VERSION", default_value = DEFAULT_CLOUD_API_VERSION, global = true)]
    pub api_version: String,

    /// Cloud API key
    #[arg(long, env = "NEXIS_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,
}

impl CloudArgs {
    /// Authenticated client; fails without an API key
    pub fn client(&self) -> Result<CloudClient> {
        let Some(api_key) = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) else {
            bail!("No API key. Pass --api-key or set NEXIS_API_KEY.");
        };
        Ok(CloudClient::new(self.api_url.clone(), self.api_version.clone()).with_api_key(Some(api_key.to_string())))
    }
}
