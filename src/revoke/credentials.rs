//! Google service-account credentials for the admin API
//!
//! A key file is exchanged for a short-lived OAuth access token by signing a
//! JWT assertion with the account's private key. The access token is cached
//! and reused until five minutes before it expires.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, RevocationError};

/// Environment variable naming the default key file
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SCOPES: &str = "https://www.googleapis.com/auth/cloud-platform \
                      https://www.googleapis.com/auth/identitytoolkit";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Fields read from a service-account JSON key
#[derive(Clone, Deserialize)]
struct KeyFile {
    #[serde(rename = "type")]
    key_type: Option<String>,
    project_id: Option<String>,
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        let buffer = Duration::minutes(5);
        self.expires_at - buffer < Utc::now()
    }
}

/// A loaded service account plus its cached access token
pub struct ServiceAccount {
    key: KeyFile,
    token: RwLock<Option<AccessToken>>,
}

// Keeps the private key out of debug output
impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.key.client_email)
            .field("project_id", &self.key.project_id)
            .field("token_uri", &self.key.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccount {
    /// Load a key file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RevocationError::Credentials(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| RevocationError::Credentials(format!("{}: {}", path.display(), e)).into())
    }

    /// Load from `path` when given, else from `GOOGLE_APPLICATION_CREDENTIALS`
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match std::env::var(CREDENTIALS_ENV) {
            Ok(value) if !value.trim().is_empty() => Self::load(Path::new(value.trim())),
            _ => Err(RevocationError::Credentials(format!(
                "No service account key. Pass --serviceAccount or set {}.",
                CREDENTIALS_ENV
            ))
            .into()),
        }
    }

    fn from_json(content: &str) -> std::result::Result<Self, String> {
        let key: KeyFile = serde_json::from_str(content).map_err(|e| e.to_string())?;
        match key.key_type.as_deref() {
            None | Some("service_account") => {}
            Some(kind) => return Err(format!("expected a service_account key, found {}", kind)),
        }
        Ok(Self {
            key,
            token: RwLock::new(None),
        })
    }

    pub fn project_id(&self) -> Option<&str> {
        self.key.project_id.as_deref()
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// Return a valid access token, exchanging a fresh assertion when needed
    pub async fn access_token(&self, http: &reqwest::Client) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
                return Ok(token.value.clone());
            }
        }

        // Concurrent callers queue here; only the first performs the exchange
        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.value.clone());
        }

        debug!("Exchanging assertion for {}", self.key.client_email);
        let assertion = self.assertion(Utc::now())?;
        let response = http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(RevocationError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(RevocationError::from)?;
        if !status.is_success() {
            return Err(RevocationError::Credentials(format!(
                "Token exchange failed ({}): {}",
                status.as_u16(),
                body
            ))
            .into());
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            RevocationError::InvalidResponse(format!("Failed to parse token response: {}", e))
        })?;

        let token = AccessToken {
            value: parsed.access_token,
            expires_at: Utc::now() + Duration::seconds(parsed.expires_in),
        };
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SCOPES,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| RevocationError::Credentials(format!("Invalid private key: {}", e)))?;

        encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
            RevocationError::Credentials(format!("Failed to sign assertion: {}", e)).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use mockito::Matcher;
    use std::io::Write;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test-service-account.pem");

    fn key_json(token_uri: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "project_id": "campuswatch-test",
            "client_email": "revoker@campuswatch-test.iam.gserviceaccount.com",
            "private_key": TEST_KEY,
            "token_uri": token_uri,
        })
        .to_string()
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(key_json(DEFAULT_TOKEN_URI).as_bytes()).unwrap();

        let account = ServiceAccount::load(file.path()).unwrap();
        assert_eq!(account.project_id(), Some("campuswatch-test"));
        assert_eq!(
            account.client_email(),
            "revoker@campuswatch-test.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServiceAccount::load(Path::new("/nonexistent/key.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_rejects_other_key_types() {
        let json = serde_json::json!({
            "type": "authorized_user",
            "client_email": "x@example.com",
            "private_key": "",
        })
        .to_string();
        let err = ServiceAccount::from_json(&json).unwrap_err();
        assert!(err.contains("authorized_user"));
    }

    #[test]
    fn test_token_uri_defaults() {
        let json = serde_json::json!({
            "client_email": "x@example.com",
            "private_key": TEST_KEY,
        })
        .to_string();
        let account = ServiceAccount::from_json(&json).unwrap();
        assert_eq!(account.key.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(account.project_id(), None);
    }

    #[test]
    fn test_assertion_claims() {
        let account = ServiceAccount::from_json(&key_json("https://oauth.test/token")).unwrap();
        let now = Utc::now();
        let jwt = account.assertion(now).unwrap();

        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(
            claims["iss"],
            "revoker@campuswatch-test.iam.gserviceaccount.com"
        );
        assert_eq!(claims["aud"], "https://oauth.test/token");
        assert_eq!(claims["iat"], now.timestamp());
        assert_eq!(claims["exp"], now.timestamp() + 3600);
        assert!(claims["scope"].as_str().unwrap().contains("identitytoolkit"));
    }

    #[test]
    fn test_invalid_private_key() {
        let json = serde_json::json!({
            "client_email": "x@example.com",
            "private_key": "not a key",
        })
        .to_string();
        let account = ServiceAccount::from_json(&json).unwrap();
        let err = account.assertion(Utc::now()).unwrap_err();
        assert!(err.to_string().contains("Invalid private key"));
    }

    #[tokio::test]
    async fn test_access_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::Regex(
                "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer".to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.cached","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let account =
            ServiceAccount::from_json(&key_json(&format!("{}/token", server.url()))).unwrap();
        let http = reqwest::Client::new();

        assert_eq!(account.access_token(&http).await.unwrap(), "ya29.cached");
        assert_eq!(account.access_token(&http).await.unwrap(), "ya29.cached");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.shared","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let account =
            ServiceAccount::from_json(&key_json(&format!("{}/token", server.url()))).unwrap();
        let http = reqwest::Client::new();

        let tokens =
            futures::future::join_all((0..20).map(|_| account.access_token(&http))).await;
        for token in tokens {
            assert_eq!(token.unwrap(), "ya29.shared");
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_access_token_near_expiry_is_replaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.short","expires_in":120}"#)
            .expect(2)
            .create_async()
            .await;

        let account =
            ServiceAccount::from_json(&key_json(&format!("{}/token", server.url()))).unwrap();
        let http = reqwest::Client::new();

        account.access_token(&http).await.unwrap();
        account.access_token(&http).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_access_token_exchange_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let account =
            ServiceAccount::from_json(&key_json(&format!("{}/token", server.url()))).unwrap();
        let err = account
            .access_token(&reqwest::Client::new())
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("400"));
        assert!(msg.contains("invalid_grant"));
    }
}
