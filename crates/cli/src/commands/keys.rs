//! Key generation and environment encryption

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nexis_common::{decode_public_key, encrypt_env, parse_env_input, KeyPair};

use crate::output::{print_json, print_success, OutputFormat};

#[derive(Args)]
pub struct KeygenArgs {
    /// Also write the raw secret to this file (default location with --save)
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Write the secret to ~/.nexis/env.key
    #[arg(long, conflicts_with = "out")]
    pub save: bool,
}

#[derive(Args)]
pub struct EncryptEnvArgs {
    /// CVM public key (base64 or hex)
    #[arg(long)]
    pub pubkey: String,

    /// Read KEY=VALUE lines from a file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Inline KEY=VALUE pairs
    pub pairs: Vec<String>,
}

/// Merge an env file and inline pairs; inline pairs win. Any malformed line
/// is an error.
pub fn load_env(file: Option<&Path>, pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut input = match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        None => String::new(),
    };
    for pair in pairs {
        input.push('\n');
        input.push_str(pair);
    }

    let (env, invalid) = parse_env_input(&input);
    if !invalid.is_empty() {
        bail!("Invalid environment lines: {}", invalid.join(", "));
    }
    Ok(env)
}

pub async fn keygen(args: KeygenArgs, format: OutputFormat) -> Result<()> {
    let pair = KeyPair::generate();
    let target = match (args.out, args.save) {
        (Some(path), _) => Some(path),
        (None, true) => Some(nexis_common::default_key_path()),
        (None, false) => None,
    };
    if let Some(path) = &target {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        pair.save(path).await?;
    }

    match format {
        OutputFormat::Json => print_json(&json!({
            "public_key": pair.public_key_base64(),
            "secret_key": pair.secret_base64(),
            "saved_to": target.as_ref().map(|p| p.display().to_string()),
        })),
        OutputFormat::Table => {
            println!("Public key: {}", pair.public_key_base64());
            println!("Secret key: {}", pair.secret_base64());
            if let Some(path) = &target {
                print_success(&format!("Secret written to {}", path.display()));
            }
        }
    }
    Ok(())
}

pub async fn encrypt(args: EncryptEnvArgs, format: OutputFormat) -> Result<()> {
    let env = load_env(args.file.as_deref(), &args.pairs)?;
    if env.is_empty() {
        bail!("No environment variables provided");
    }
    let public_key = decode_public_key(&args.pubkey)?;
    let payload = encrypt_env(&env, &public_key)?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "encrypted_env": payload,
            "env_keys": env.keys().collect::<Vec<_>>(),
        })),
        OutputFormat::Table => println!("{payload}"),
    }
    Ok(())
}
