//! Small JSON documents persisted under the console data directory.
//!
//! Each store reads and overwrites a whole file. There is no locking; the
//! console expects a single administrator.

pub mod api_keys;
pub mod teams;

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

use nexis_common::Result;

pub use api_keys::{ApiKeyRecord, ApiKeyStore, ApiKeyView};
pub use teams::{TeamMember, TeamRecord, TeamRole, TeamStore};

/// Typed view of one JSON file
#[derive(Debug, Clone)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files yield `T::default()`.
    pub async fn read(&self) -> T {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(_) => return T::default(),
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            debug!(path = %self.path.display(), error = %e, "Ignoring corrupt store file");
            T::default()
        })
    }

    pub async fn write(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// Trimmed id made only of `[A-Za-z0-9_-]`.
pub fn sanitize_id(value: &str) -> Option<String> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return None;
    }
    normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        .then(|| normalized.to_string())
}

/// Basename of `filename` with anything outside `[A-Za-z0-9._-]` replaced by `-`.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let base = filename
        .rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() {
        return None;
    }
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    Some(sanitized)
}

/// ISO-8601 UTC timestamp with millisecond precision
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
