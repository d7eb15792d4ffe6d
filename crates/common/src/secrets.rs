//! At-rest secret envelope.
//!
//! Secrets stored by the console (agent env/header values, locally issued API
//! keys) are sealed with AES-256-GCM under a server-held key. The envelope is
//! `v1:<iv>:<tag>:<ciphertext>` with each part standard base64.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const VERSION_PREFIX: &str = "v1";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM sealing key for stored secrets
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; 32],
}

impl SecretBox {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Decode key material: 64 hex characters, or base64 of exactly 32 bytes.
    pub fn from_key_material(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(trimmed).ok()?;
            return bytes.try_into().ok().map(Self::new);
        }
        let bytes = STANDARD.decode(trimmed).ok()?;
        bytes.try_into().ok().map(Self::new)
    }

    /// Seal a plaintext into a `v1:` envelope.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        // aes-gcm appends the tag to the ciphertext
        let sealed = cipher.encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok([
            VERSION_PREFIX.to_string(),
            STANDARD.encode(iv),
            STANDARD.encode(tag),
            STANDARD.encode(ciphertext),
        ]
        .join(":"))
    }

    /// Open a `v1:` envelope.
    pub fn open(&self, envelope: &str) -> Result<String> {
        let invalid = || Error::Crypto("Invalid secret payload.".to_string());

        let mut parts = envelope.split(':');
        let version = parts.next().ok_or_else(invalid)?;
        let iv_b64 = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let tag_b64 = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let body_b64 = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        if version != VERSION_PREFIX {
            return Err(invalid());
        }

        let iv = STANDARD.decode(iv_b64).map_err(|_| invalid())?;
        let tag = STANDARD.decode(tag_b64).map_err(|_| invalid())?;
        let mut body = STANDARD.decode(body_b64).map_err(|_| invalid())?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(invalid());
        }
        body.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher.decrypt(Nonce::from_slice(&iv), body.as_slice())?;
        String::from_utf8(plaintext).map_err(|e| Error::Crypto(e.to_string()))
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").field("key", &"<redacted>").finish()
    }
}

/// Mask a secret for display: `abcd…wxyz`, or all bullets when short.
pub fn mask_secret(value: &str, visible: usize) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= visible * 2 {
        return "•".repeat(chars.len());
    }
    let head: String = chars[..visible].iter().collect();
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{head}…{tail}")
}

/// Stable, non-reversible identifier for an API key session.
pub fn api_key_fingerprint(api_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(api_key.as_bytes()));
    format!("api_{}", &digest[..16])
}
