//! Environment-variable sealing for CVMs
//!
//! A CVM publishes an X25519 public key at provision time. Env vars are sealed
//! to it with an ephemeral X25519 key and AES-256-GCM; the raw shared secret is
//! the AES key and the ephemeral public key is bound in as AAD.
//!
//! Wire format (hex): `ephemeral_pubkey[32] || nonce[12] || ciphertext+tag`.

use std::collections::BTreeMap;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

const PUBKEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// X25519 key pair, as held by a CVM (or by tests standing in for one)
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Load the raw 32-byte secret from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path).await?;
        let bytes: [u8; 32] = data
            .try_into()
            .map_err(|_| Error::Crypto("Invalid key length".to_string()))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Save the raw secret to file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.secret.to_bytes()).await?;
        Ok(())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key().as_bytes())
    }

    pub fn secret_base64(&self) -> String {
        STANDARD.encode(self.secret.to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

/// Plaintext document sealed into `encrypted_env`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvDocument {
    pub env: BTreeMap<String, String>,
}

/// Decode a VM public key given as base64 (standard or url-safe, padding
/// optional) or as 64 hex characters.
pub fn decode_public_key(text: &str) -> Result<PublicKey> {
    let trimmed = text.trim();
    let bytes = if trimmed.len() == PUBKEY_LEN * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(trimmed).map_err(|e| Error::Crypto(e.to_string()))?
    } else {
        let normalized: String = trimmed
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                other => other,
            })
            .collect();
        URL_SAFE_NO_PAD
            .decode(normalized)
            .map_err(|e| Error::Crypto(format!("Invalid public key encoding: {e}")))?
    };
    let bytes: [u8; PUBKEY_LEN] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid public key length".to_string()))?;
    Ok(PublicKey::from(bytes))
}

/// Seal env vars to a CVM public key. Returns the hex wire payload.
pub fn encrypt_env(env: &BTreeMap<String, String>, vm_public_key: &PublicKey) -> Result<String> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_with(env, vm_public_key, &ephemeral, nonce)
}

fn seal_with(
    env: &BTreeMap<String, String>,
    vm_public_key: &PublicKey,
    ephemeral: &StaticSecret,
    nonce: [u8; NONCE_LEN],
) -> Result<String> {
    let ephemeral_public = PublicKey::from(ephemeral);
    let shared = ephemeral.diffie_hellman(vm_public_key);

    let plaintext = serde_json::to_vec(&EnvDocument { env: env.clone() })?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(shared.as_bytes()));
    let ciphertext = cipher.encrypt(
        Nonce::from_slice(&nonce),
        Payload {
            msg: &plaintext,
            aad: ephemeral_public.as_bytes(),
        },
    )?;

    let mut out = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Open a hex payload with the CVM's secret key.
pub fn decrypt_env(payload_hex: &str, vm_key: &KeyPair) -> Result<BTreeMap<String, String>> {
    let bytes = hex::decode(payload_hex.trim())
        .map_err(|e| Error::Crypto(format!("Invalid payload hex: {e}")))?;
    if bytes.len() < PUBKEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(Error::Crypto("Encrypted payload is too short".to_string()));
    }
    let (pubkey, rest) = bytes.split_at(PUBKEY_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let mut eph = [0u8; PUBKEY_LEN];
    eph.copy_from_slice(pubkey);
    let shared = vm_key.secret.diffie_hellman(&PublicKey::from(eph));

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(shared.as_bytes()));
    let plaintext = cipher.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad: pubkey,
        },
    )?;
    let doc: EnvDocument = serde_json::from_slice(&plaintext)?;
    Ok(doc.env)
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped; lines
/// with no key are returned as invalid. Values may be empty.
pub fn parse_env_input(input: &str) -> (BTreeMap<String, String>, Vec<String>) {
    let mut env = BTreeMap::new();
    let mut invalid = Vec::new();

    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.find('=') {
            Some(idx) if idx > 0 => {
                let key = trimmed[..idx].trim();
                let value = trimmed[idx + 1..].trim();
                if key.is_empty() {
                    invalid.push(trimmed.to_string());
                    continue;
                }
                env.insert(key.to_string(), value.to_string());
            }
            _ => invalid.push(trimmed.to_string()),
        }
    }

    (env, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("DATABASE_URL".to_string(), "postgres://db/app".to_string());
        env.insert("API_TOKEN".to_string(), "t0ken=with=equals".to_string());
        env
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vm = KeyPair::generate();
        let payload = encrypt_env(&sample_env(), &vm.public_key()).unwrap();
        assert_eq!(decrypt_env(&payload, &vm).unwrap(), sample_env());
    }

    #[test]
    fn test_deterministic_layout() {
        let vm = KeyPair::from_secret_bytes([3u8; 32]);
        let eph = StaticSecret::from([5u8; 32]);
        let nonce = [9u8; NONCE_LEN];
        let payload = seal_with(&sample_env(), &vm.public_key(), &eph, nonce).unwrap();
        let bytes = hex::decode(&payload).unwrap();

        assert_eq!(&bytes[..32], PublicKey::from(&eph).as_bytes());
        assert_eq!(&bytes[32..44], &nonce);
        // Same inputs give the same output
        assert_eq!(payload, seal_with(&sample_env(), &vm.public_key(), &eph, nonce).unwrap());
        assert_eq!(decrypt_env(&payload, &vm).unwrap(), sample_env());
    }

    #[test]
    fn test_wrong_key_and_tampered_aad_fail() {
        let vm = KeyPair::generate();
        let payload = encrypt_env(&sample_env(), &vm.public_key()).unwrap();
        assert!(decrypt_env(&payload, &KeyPair::generate()).is_err());

        // Flip a bit in the embedded ephemeral key (the AAD)
        let mut bytes = hex::decode(&payload).unwrap();
        bytes[0] ^= 0x80;
        assert!(decrypt_env(&hex::encode(bytes), &vm).is_err());
        assert!(decrypt_env("abcd", &vm).is_err());
    }

    #[test]
    fn test_decode_public_key_variants() {
        let vm = KeyPair::generate();
        let raw = *vm.public_key().as_bytes();

        let std_b64 = STANDARD.encode(raw);
        let url_b64 = URL_SAFE_NO_PAD.encode(raw);
        let hex_key = hex::encode(raw);
        for text in [std_b64.as_str(), url_b64.as_str(), hex_key.as_str()] {
            assert_eq!(decode_public_key(text).unwrap().as_bytes(), &raw);
        }

        assert!(decode_public_key("!!!").is_err());
        assert!(decode_public_key(&STANDARD.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_parse_env_input() {
        let (env, invalid) = parse_env_input(
            "# comment\nFOO=bar\n\n  SPACED = value  \nEMPTY=\n=novalue\nbroken\n",
        );
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("SPACED").map(String::as_str), Some("value"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(invalid, vec!["=novalue".to_string(), "broken".to_string()]);
    }

    #[test]
    fn test_keypair_debug_hides_secret() {
        let kp = KeyPair::generate();
        let rendered = format!("{:?}", kp);
        assert!(rendered.contains(&kp.public_key_base64()));
        assert!(!rendered.contains(&kp.secret_base64()));
    }

    #[tokio::test]
    async fn test_keypair_save_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vm.key");
        let kp = KeyPair::generate();
        kp.save(&path).await.unwrap();
        let loaded = KeyPair::load(&path).await.unwrap();
        assert_eq!(loaded.public_key_base64(), kp.public_key_base64());
    }
}
