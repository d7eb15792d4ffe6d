//! Locally issued API keys.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

use nexis_common::{Result, SecretBox};

use super::{now_iso, JsonFileStore};

pub const KEY_PREFIX: &str = "nexis_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub label: String,
    pub prefix: String,
    pub created_at: Option<String>,
    pub last_used_at: Option<String>,
    pub revoked_at: Option<String>,
    /// Sealed plaintext key
    pub secret: String,
    pub created_by: Option<String>,
}

/// A key as shown to users; never carries the secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyView {
    pub id: String,
    pub label: String,
    pub prefix: String,
    pub created_at: Option<String>,
    pub last_used_at: Option<String>,
    pub revoked_at: Option<String>,
    pub created_by: Option<String>,
}

impl From<&ApiKeyRecord> for ApiKeyView {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            label: record.label.clone(),
            prefix: record.prefix.clone(),
            created_at: record.created_at.clone(),
            last_used_at: record.last_used_at.clone(),
            revoked_at: record.revoked_at.clone(),
            created_by: record.created_by.clone(),
        }
    }
}

/// `nexis_` + base64url of 24 random bytes, and its 10-char display prefix
pub fn generate_api_key() -> (String, String) {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    let value = format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw));
    let prefix = value.chars().take(10).collect();
    (value, prefix)
}

/// Store at `<data>/api-keys/keys.json`
#[derive(Debug, Clone)]
pub struct ApiKeyStore {
    file: JsonFileStore<Vec<ApiKeyRecord>>,
}

impl ApiKeyStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file: JsonFileStore::new(data_dir.join("api-keys").join("keys.json")),
        }
    }

    pub async fn list(&self) -> Vec<ApiKeyView> {
        self.file.read().await.iter().map(ApiKeyView::from).collect()
    }

    /// Issue a key. Returns the new record view and the plaintext, which is
    /// only ever shown once.
    pub async fn create(
        &self,
        secrets: &SecretBox,
        label: &str,
        created_by: Option<String>,
    ) -> Result<(ApiKeyView, String)> {
        let (value, prefix) = generate_api_key();
        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            prefix,
            created_at: Some(now_iso()),
            last_used_at: None,
            revoked_at: None,
            secret: secrets.seal(&value)?,
            created_by,
        };
        let view = ApiKeyView::from(&record);

        let mut records = self.file.read().await;
        records.insert(0, record);
        self.file.write(&records).await?;
        Ok((view, value))
    }

    /// Stamp `revokedAt`; `None` when the id is unknown.
    pub async fn revoke(&self, id: &str) -> Result<Option<ApiKeyView>> {
        let mut records = self.file.read().await;
        let now = now_iso();
        let mut revoked = None;
        for record in records.iter_mut().filter(|r| r.id == id) {
            record.revoked_at = Some(now.clone());
            revoked = Some(ApiKeyView::from(&*record));
        }
        self.file.write(&records).await?;
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_key_shape() {
        let (value, prefix) = generate_api_key();
        assert!(value.starts_with("nexis_"));
        assert_eq!(value.len(), 6 + 32);
        assert_eq!(prefix, &value[..10]);
        assert_ne!(generate_api_key().0, value);
    }

    #[tokio::test]
    async fn test_create_list_revoke() {
        let dir = TempDir::new().unwrap();
        let store = ApiKeyStore::new(dir.path());
        let secrets = SecretBox::new([3u8; 32]);

        let (first, _) = store.create(&secrets, "ci", Some("api_1".into())).await.unwrap();
        let (second, plaintext) = store.create(&secrets, "deploy", None).await.unwrap();

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].created_by.as_deref(), Some("api_1"));

        let raw = tokio::fs::read_to_string(dir.path().join("api-keys/keys.json"))
            .await
            .unwrap();
        assert!(!raw.contains(&plaintext));
        let records: Vec<ApiKeyRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(secrets.open(&records[0].secret).unwrap(), plaintext);

        let revoked = store.revoke(&first.id).await.unwrap().unwrap();
        assert!(revoked.revoked_at.is_some());
        assert!(store.revoke("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_view_hides_secret() {
        let record = ApiKeyRecord {
            id: "1".into(),
            label: "l".into(),
            prefix: "nexis_abcd".into(),
            created_at: None,
            last_used_at: None,
            revoked_at: None,
            secret: "v1:a:b:c".into(),
            created_by: None,
        };
        let json = serde_json::to_value(ApiKeyView::from(&record)).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["prefix"], "nexis_abcd");
    }
}
