//! Privy identity tokens and the Privy admin API.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use nexis_common::upstream::{join_url, FetchResult};
use nexis_common::{Error, Result};

pub const PRIVY_ISSUER: &str = "privy.io";

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    iss: String,
    iat: Option<i64>,
    exp: i64,
    sid: Option<String>,
}

/// Verified token claims, in the shape the session endpoint reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrivyClaims {
    pub app_id: String,
    pub user_id: String,
    pub issuer: String,
    pub issued_at: Option<i64>,
    pub expiration: i64,
    pub session_id: Option<String>,
}

/// ES256 verifier bound to one Privy app
pub struct PrivyVerifier {
    app_id: String,
    key: DecodingKey,
}

impl std::fmt::Debug for PrivyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivyVerifier").field("app_id", &self.app_id).finish()
    }
}

impl PrivyVerifier {
    /// `pem` may carry literal `\n` escapes, as it does when set through env files.
    pub fn new(app_id: &str, pem: &str) -> Result<Self> {
        let pem = pem.trim().replace("\\n", "\n");
        let key = DecodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("Privy verification key: {e}")))?;
        Ok(Self {
            app_id: app_id.to_string(),
            key,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn verify(&self, token: &str) -> Result<PrivyClaims> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[self.app_id.as_str()]);
        validation.set_issuer(&[PRIVY_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = decode::<RawClaims>(token, &self.key, &validation)
            .map_err(|e| Error::Validation(format!("Invalid Privy token: {e}")))?;
        let claims = data.claims;
        Ok(PrivyClaims {
            app_id: self.app_id.clone(),
            user_id: claims.sub,
            issuer: claims.iss,
            issued_at: claims.iat,
            expiration: claims.exp,
            session_id: claims.sid,
        })
    }
}

/// Privy REST admin client (basic auth with app id and secret)
#[derive(Clone)]
pub struct PrivyAdmin {
    http: Client,
    api_url: String,
    app_id: String,
    app_secret: String,
}

impl std::fmt::Debug for PrivyAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivyAdmin")
            .field("api_url", &self.api_url)
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

impl PrivyAdmin {
    pub fn new(http: Client, api_url: &str, app_id: &str, app_secret: &str) -> Self {
        Self {
            http,
            api_url: api_url.to_string(),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
        }
    }

    fn user_url(&self, user_id: &str, suffix: &str) -> String {
        join_url(
            &self.api_url,
            &format!("/api/v1/users/{}{suffix}", urlencoding::encode(user_id)),
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .header("privy-app-id", &self.app_id)
            .send()
            .await?;
        FetchResult::from_response(response).await?.into_result()
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Value> {
        self.send(self.http.get(self.user_url(user_id, ""))).await
    }

    pub async fn set_custom_metadata(&self, user_id: &str, metadata: &Map<String, Value>) -> Result<Value> {
        let body = json!({ "custom_metadata": metadata });
        self.send(self.http.post(self.user_url(user_id, "/custom_metadata")).json(&body))
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub const PRIVATE_PEM: &str = include_str!("../../tests/fixtures/privy_es256.pem");
    pub const PUBLIC_PEM: &str = include_str!("../../tests/fixtures/privy_es256.pub.pem");

    pub fn sign(app_id: &str, sub: &str, iss: &str, exp_offset: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = json!({
            "sub": sub,
            "iss": iss,
            "aud": app_id,
            "iat": now,
            "exp": now + exp_offset,
            "sid": "sess-1",
        });
        let key = EncodingKey::from_ec_pem(PRIVATE_PEM.as_bytes()).unwrap();
        encode(&Header::new(Algorithm::ES256), &claims, &key).unwrap()
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = PrivyVerifier::new("app-1", PUBLIC_PEM).unwrap();
        let claims = verifier
            .verify(&sign("app-1", "did:privy:u1", PRIVY_ISSUER, 600))
            .unwrap();
        assert_eq!(claims.user_id, "did:privy:u1");
        assert_eq!(claims.app_id, "app-1");
        assert_eq!(claims.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_rejects_wrong_audience_issuer_and_expired() {
        let verifier = PrivyVerifier::new("app-1", PUBLIC_PEM).unwrap();
        assert!(verifier.verify(&sign("app-2", "u", PRIVY_ISSUER, 600)).is_err());
        assert!(verifier.verify(&sign("app-1", "u", "evil.io", 600)).is_err());
        assert!(verifier.verify(&sign("app-1", "u", PRIVY_ISSUER, -3600)).is_err());
        assert!(verifier.verify("not-a-jwt").is_err());
    }

    #[test]
    fn test_escaped_newlines_in_pem() {
        let escaped = PUBLIC_PEM.trim().replace('\n', "\\n");
        assert!(PrivyVerifier::new("app-1", &escaped).is_ok());
        assert!(PrivyVerifier::new("app-1", "garbage").is_err());
    }

    #[tokio::test]
    async fn test_admin_user_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/user-1"))
            .and(header("privy-app-id", "app-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "user-1",
                "custom_metadata": {"display_name": "Ada"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/users/user-1/custom_metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "custom_metadata": {"display_name": "Grace"}
            })))
            .mount(&server)
            .await;

        let admin = PrivyAdmin::new(Client::new(), &server.uri(), "app-1", "secret");
        let user = admin.get_user("user-1").await.unwrap();
        assert_eq!(user["custom_metadata"]["display_name"], "Ada");

        let mut metadata = Map::new();
        metadata.insert("display_name".into(), json!("Grace"));
        let updated = admin.set_custom_metadata("user-1", &metadata).await.unwrap();
        assert_eq!(updated["custom_metadata"]["display_name"], "Grace");
    }
}
