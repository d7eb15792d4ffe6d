//! Deploy a compose file as a new CVM
//!
//! Provision reserves resources and returns the compose hash and, for
//! built-in KMS nodes, the key used to seal environment variables. Commit
//! then creates the CVM from that provision.

use anyhow::{bail, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use nexis_common::deploy::{default_node, TeepodNode};
use nexis_common::{decode_public_key, encrypt_env, CloudClient, CommitRequest, DeployDraft};

use super::keys::load_env;
use crate::output::{print_info, print_json, print_success, print_warning, OutputFormat};

#[derive(Args)]
pub struct DeployArgs {
    /// CVM name
    #[arg(long)]
    pub name: String,

    /// Docker Compose file
    #[arg(long)]
    pub compose: PathBuf,

    /// Node (teepod) id; defaults to the first built-in KMS node
    #[arg(long)]
    pub node: Option<u64>,

    /// OS image name
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long)]
    pub instance_type: Option<String>,

    #[arg(long)]
    pub vcpu: Option<u64>,

    /// Memory in MB
    #[arg(long)]
    pub memory: Option<u64>,

    /// Disk size in GB
    #[arg(long)]
    pub disk_size: Option<u64>,

    /// KEY=VALUE file to encrypt into the CVM
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Comma-separated allowed env keys (defaults to the keys in --env-file)
    #[arg(long)]
    pub env_keys: Option<String>,

    /// Comma or newline separated SSH public keys
    #[arg(long)]
    pub ssh_keys: Option<String>,

    /// Hide the CVM from public listings
    #[arg(long)]
    pub unlisted: bool,
}

fn number(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl DeployArgs {
    /// Draft for the selected node
    pub fn draft(&self, docker_compose: String, node: Option<&TeepodNode>, env_keys: &[String]) -> DeployDraft {
        let mut draft = DeployDraft {
            name: self.name.clone(),
            node_id: node.map(|n| n.teepod_id.to_string()).unwrap_or_default(),
            image: self.image.clone().unwrap_or_default(),
            instance_type: self.instance_type.clone().unwrap_or_default(),
            vcpu: number(self.vcpu),
            memory: number(self.memory),
            disk_size: number(self.disk_size),
            listed: !self.unlisted,
            env_keys: self.env_keys.clone().unwrap_or_else(|| env_keys.join(",")),
            ssh_keys: self.ssh_keys.clone().unwrap_or_default(),
            docker_compose,
            ..DeployDraft::default()
        };
        draft.apply_ssh_keys();
        draft
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        bar.set_style(style);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

pub async fn execute(args: DeployArgs, client: &CloudClient, format: OutputFormat) -> Result<()> {
    let compose = tokio::fs::read_to_string(&args.compose)
        .await
        .with_context(|| format!("reading {}", args.compose.display()))?;
    let env = match &args.env_file {
        Some(path) => load_env(Some(path), &[])?,
        None => Default::default(),
    };

    let nodes = client.available_nodes().await?;
    let node = match args.node {
        Some(id) => match nodes.iter().find(|n| n.teepod_id == id) {
            Some(node) => Some(node),
            None => bail!("Node {id} is not available"),
        },
        None => default_node(&nodes),
    };

    let env_keys: Vec<String> = env.keys().cloned().collect();
    let draft = args.draft(compose, node, &env_keys);
    draft.validate(node)?;

    let bar = spinner("Provisioning resources...");
    let provision = client.provision(&draft.provision_request()).await;
    bar.finish_and_clear();
    let provision = provision?;
    debug!(app_id = ?provision.app_id, compose_hash = ?provision.compose_hash, "Provisioned");

    let encrypted_env = if env.is_empty() {
        None
    } else {
        match provision.app_env_encrypt_pubkey.as_deref().filter(|k| !k.is_empty()) {
            Some(pubkey) => Some(encrypt_env(&env, &decode_public_key(pubkey)?)?),
            None => {
                print_warning("Provision returned no encryption key; environment variables were not sent.");
                None
            }
        }
    };

    let commit = CommitRequest::from_provision(&provision, encrypted_env, draft.env_key_list())?;
    let bar = spinner("Creating CVM...");
    let created = client.commit(&commit).await;
    bar.finish_and_clear();
    let created = created?;

    match format {
        OutputFormat::Json => print_json(&json!({ "provision": provision, "cvm": created })),
        OutputFormat::Table => {
            print_success(&format!(
                "Deployed {} ({})",
                created.name.as_deref().unwrap_or(&args.name),
                created.app_id.as_deref().unwrap_or(commit.app_id())
            ));
            print_info(&format!("Follow progress with: nexis watch {}", commit.app_id()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: DeployArgs,
    }

    fn args(extra: &[&str]) -> DeployArgs {
        let mut argv = vec!["deploy", "--name", " web ", "--compose", "compose.yml"];
        argv.extend_from_slice(extra);
        Wrapper::parse_from(argv).args
    }

    #[test]
    fn test_draft_from_flags() {
        let args = args(&["--vcpu", "2", "--memory", "4096", "--unlisted", "--ssh-keys", "ssh-ed25519 AAA"]);
        let draft = args.draft("services: {}".into(), None, &["A".to_string(), "B".to_string()]);
        assert_eq!(draft.vcpu, "2");
        assert!(!draft.listed);
        assert_eq!(draft.env_key_list(), Some(vec!["A".to_string(), "B".to_string()]));
        assert!(draft.pre_launch_script.contains("ssh-ed25519 AAA"));

        let request = draft.provision_request();
        assert_eq!(request.name, "web");
        assert_eq!(request.memory, Some(4096));
        assert_eq!(request.teepod_id, None);
        assert_eq!(request.compose_file.docker_compose_file, "services: {}");
    }

    #[test]
    fn test_explicit_env_keys_win() {
        let args = args(&["--env-keys", "ONLY"]);
        let draft = args.draft("x".into(), None, &["A".to_string()]);
        assert_eq!(draft.env_key_list(), Some(vec!["ONLY".to_string()]));
    }
}
