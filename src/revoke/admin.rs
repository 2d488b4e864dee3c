//! Identity admin API used by the batch revoker

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::credentials::ServiceAccount;
use crate::error::{Result, RevocationError};

/// Production Identity Toolkit endpoint
pub const IDENTITY_TOOLKIT_ENDPOINT: &str = "https://identitytoolkit.googleapis.com/v1";

/// When set, requests go to the local auth emulator instead
pub const EMULATOR_HOST_ENV: &str = "FIREBASE_AUTH_EMULATOR_HOST";

const PROJECT_ENV_VARS: [&str; 2] = ["GCLOUD_PROJECT", "GOOGLE_CLOUD_PROJECT"];

/// A user as reported after revocation
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub uid: String,
    pub email: Option<String>,
    /// Tokens issued before this instant are rejected
    pub tokens_valid_after: Option<DateTime<Utc>>,
}

/// Administrative operations on user sessions
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Invalidate every refresh token issued to `uid` so far
    async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()>;

    async fn get_user(&self, uid: &str) -> Result<UserRecord>;
}

enum Authorization {
    Emulator,
    ServiceAccount(ServiceAccount),
}

/// [`AdminApi`] backed by the Identity Toolkit REST API
pub struct IdentityToolkitClient {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    auth: Authorization,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
    valid_since: Option<String>,
}

impl IdentityToolkitClient {
    /// Client authorized by a service account
    pub fn new(account: ServiceAccount, project_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: IDENTITY_TOOLKIT_ENDPOINT.to_string(),
            project_id,
            auth: Authorization::ServiceAccount(account),
        }
    }

    /// Client for the local auth emulator at `host` (for example `localhost:9099`)
    pub fn emulator(host: &str, project_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("http://{}/identitytoolkit.googleapis.com/v1", host),
            project_id,
            auth: Authorization::Emulator,
        }
    }

    /// Resolve endpoint, project and credentials from the environment.
    ///
    /// The emulator needs no credentials; otherwise the key comes from
    /// `service_account` or `GOOGLE_APPLICATION_CREDENTIALS`.
    pub fn from_env(service_account: Option<&Path>) -> Result<Self> {
        let env_project = PROJECT_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.trim().is_empty());

        if let Some(host) = std::env::var(EMULATOR_HOST_ENV)
            .ok()
            .filter(|h| !h.trim().is_empty())
        {
            let project_id = match env_project {
                Some(project) => project,
                None => match service_account {
                    Some(path) => ServiceAccount::load(path)?
                        .project_id()
                        .map(str::to_string)
                        .ok_or(RevocationError::MissingProjectId)?,
                    None => return Err(RevocationError::MissingProjectId.into()),
                },
            };
            debug!("Using auth emulator at {} for project {}", host, project_id);
            return Ok(Self::emulator(host.trim(), project_id));
        }

        let account = ServiceAccount::discover(service_account)?;
        let project_id = account
            .project_id()
            .map(str::to_string)
            .or(env_project)
            .ok_or(RevocationError::MissingProjectId)?;
        Ok(Self::new(account, project_id))
    }

    /// Override the API endpoint
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn bearer(&self) -> Result<String> {
        match &self.auth {
            Authorization::Emulator => Ok("owner".to_string()),
            Authorization::ServiceAccount(account) => account.access_token(&self.http).await,
        }
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, uid: &str, body: Value) -> Result<T> {
        let url = format!(
            "{}/projects/{}/accounts:{}",
            self.endpoint, self.project_id, action
        );
        let token = self.bearer().await?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(RevocationError::from)?;

        let status = response.status();
        let text = response.text().await.map_err(RevocationError::from)?;

        if !status.is_success() {
            let message = api_error_message(&text);
            if message.starts_with("USER_NOT_FOUND") {
                return Err(RevocationError::UserNotFound(uid.to_string()).into());
            }
            return Err(RevocationError::Api {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        serde_json::from_str(&text).map_err(|e| {
            RevocationError::InvalidResponse(format!("accounts:{}: {}", action, e)).into()
        })
    }
}

#[async_trait]
impl AdminApi for IdentityToolkitClient {
    async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()> {
        let body = json!({ "localId": uid, "validSince": Utc::now().timestamp() });
        let _: Value = self.call("update", uid, body).await?;
        Ok(())
    }

    async fn get_user(&self, uid: &str) -> Result<UserRecord> {
        let body = json!({ "localId": [uid] });
        let response: LookupResponse = self.call("lookup", uid, body).await?;
        let user = response
            .users
            .into_iter()
            .next()
            .ok_or_else(|| RevocationError::UserNotFound(uid.to_string()))?;

        let tokens_valid_after = user
            .valid_since
            .as_deref()
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Ok(UserRecord {
            uid: user.local_id,
            email: user.email,
            tokens_valid_after,
        })
    }
}

/// `{"error": {"message": ...}}`, else the raw body
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                "empty response".to_string()
            } else {
                body.trim().to_string()
            }
        })
}
