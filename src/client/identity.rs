//! Identity provider seam used for forced token refresh

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;

use crate::error::{Result, SessionError};

/// Default Secure Token service host
pub const SECURE_TOKEN_ENDPOINT: &str = "https://securetoken.googleapis.com";

/// Source of fresh bearer tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtain a newly signed token, bypassing any cached one.
    ///
    /// `Ok(None)` means the provider has no signed-in user to refresh.
    async fn force_refresh(&self) -> Result<Option<String>>;
}

/// Provider used when no refresh credentials are configured: never yields a token.
#[derive(Debug, Default)]
pub struct UnconfiguredProvider;

#[async_trait]
impl IdentityProvider for UnconfiguredProvider {
    async fn force_refresh(&self) -> Result<Option<String>> {
        warn!("Token refresh requested but no identity credentials are configured");
        Ok(None)
    }
}

/// Refresh-token exchange against the Secure Token REST API.
pub struct SecureTokenProvider {
    http: HttpClient,
    endpoint: String,
    api_key: String,
    refresh_token: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: TokenErrorBody,
}

#[derive(Deserialize)]
struct TokenErrorBody {
    message: String,
}

impl SecureTokenProvider {
    pub fn new(api_key: String, refresh_token: Option<String>) -> Result<Self> {
        Self::with_endpoint(api_key, refresh_token, None)
    }

    /// Create a provider against a custom endpoint (for emulators and tests)
    pub fn with_endpoint(
        api_key: String,
        refresh_token: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| SessionError::Provider(e.to_string()))?;

        let endpoint = endpoint
            .unwrap_or_else(|| SECURE_TOKEN_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            endpoint,
            api_key,
            refresh_token: RwLock::new(refresh_token),
        })
    }

    /// Current refresh token; rotates after each successful refresh.
    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl IdentityProvider for SecureTokenProvider {
    async fn force_refresh(&self) -> Result<Option<String>> {
        let Some(refresh_token) = self.refresh_token() else {
            debug!("No refresh token held, nothing to refresh");
            return Ok(None);
        };

        let url = format!("{}/v1/token", self.endpoint);
        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SessionError::Provider(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SessionError::Provider(format!("Failed to read response: {}", e)))?;

        if status != StatusCode::OK {
            let message = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("Token refresh failed with status {}", status));
            return Err(SessionError::Provider(message).into());
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            SessionError::Provider(format!("Failed to parse token response: {}", e))
        })?;

        if let Some(rotated) = token.refresh_token {
            *self
                .refresh_token
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(rotated);
        }

        debug!("Obtained refreshed ID token");
        Ok(Some(token.id_token))
    }
}
