//! Nexis Common Library
//!
//! Shared types, crypto, and cloud API access for the Nexis console and CLI.

pub mod cloud;
pub mod crypto;
pub mod cvm;
pub mod deploy;
pub mod error;
pub mod json;
pub mod secrets;
pub mod state_stream;
pub mod upstream;

// Re-export commonly used types
pub use cloud::CloudClient;
pub use crypto::{decode_public_key, decrypt_env, encrypt_env, parse_env_input, KeyPair};
pub use cvm::{CvmAction, CvmDetail, CvmPage, CvmStatus, CvmSummary, VisibilityUpdate};
pub use deploy::{CommitRequest, DeployDraft, ProvisionRequest, ProvisionResponse};
pub use error::{Error, Result};
pub use secrets::SecretBox;
pub use state_stream::{StateEvent, StateSource, StateWatcher, WatchUpdate};
pub use upstream::{Candidate, FetchResult, ServiceClient};

/// Nexis version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default directory for locally persisted console data
pub fn default_data_dir() -> std::path::PathBuf {
    std::env::var_os("NEXIS_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(".data"))
}

/// Default path for the CLI's X25519 key file
pub fn default_key_path() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".nexis")
        .join("env.key")
}
