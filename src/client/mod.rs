//! Authenticated HTTP client for the CampusWatch backend
//!
//! Every call attaches the stored bearer token. A 401 or 403 triggers one
//! forced refresh through the [`IdentityProvider`] and one retry with the new
//! token; if the refresh yields nothing, the session is cleared and the
//! registered session-expired handler runs.

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::{ConfigError, Error, RequestError, Result};
use crate::session::{AuthEvent, SessionService};

pub mod identity;
#[cfg(test)]
pub mod mock;

pub use identity::{IdentityProvider, SecureTokenProvider, UnconfiguredProvider};

type SessionExpiredHandler = Arc<dyn Fn() + Send + Sync>;

/// How a successful response body is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseMode {
    Json,
    Binary,
}

/// Decoded response body
#[derive(Debug)]
enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

/// Progress of a single call through the refresh-and-retry sequence.
///
/// Only `Sending` can lead to `AwaitingRefresh`, and `Retrying` always ends
/// in `Done`, so a call refreshes at most once and retries at most once.
#[derive(Debug)]
enum RequestState {
    Sending,
    AwaitingRefresh,
    Retrying { token: String },
    Done(Response),
    Failed(Error),
}

/// Request that can be replayed for the single retry
struct PreparedRequest {
    method: Method,
    url: Url,
    body: Option<Vec<u8>>,
}

/// HTTP client that owns the refresh-and-retry policy
pub struct AuthenticatedClient {
    http: HttpClient,
    base_url: Url,
    session: Arc<SessionService>,
    provider: Arc<dyn IdentityProvider>,
    on_session_expired: RwLock<Option<SessionExpiredHandler>>,
}

impl AuthenticatedClient {
    /// Create a client for the backend at `base_url`
    pub fn new(
        base_url: &str,
        session: Arc<SessionService>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        // No client-side timeout: the transport default applies
        let http = HttpClient::builder().build().map_err(RequestError::from)?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            session,
            provider,
            on_session_expired: RwLock::new(None),
        })
    }

    pub fn session(&self) -> &Arc<SessionService> {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Register the handler run after an irrecoverable auth failure clears
    /// the session. It runs synchronously and must not issue requests through
    /// this client.
    pub fn set_session_expired_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .on_session_expired
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Issue a request and parse the response as JSON. An empty body yields `null`.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let body = body.map(serde_json::to_vec).transpose()?;
        match self.execute(method, path, body, ResponseMode::Json).await? {
            Payload::Json(value) => Ok(value),
            Payload::Binary(_) => Err(RequestError::InvalidResponse(
                "expected a JSON body".to_string(),
            )
            .into()),
        }
    }

    /// Issue a request and return the raw response payload without parsing.
    pub async fn request_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Vec<u8>> {
        let body = body.map(serde_json::to_vec).transpose()?;
        match self.execute(method, path, body, ResponseMode::Binary).await? {
            Payload::Binary(bytes) => Ok(bytes),
            Payload::Json(value) => Ok(serde_json::to_vec(&value)?),
        }
    }

    /// GET `path` and deserialize the response
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.request(Method::GET, path, None).await?;
        decode(value)
    }

    /// Send `body` as JSON and deserialize the response
    pub async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        let value = self.request(method, path, Some(&body)).await?;
        decode(value)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        mode: ResponseMode,
    ) -> Result<Payload> {
        let request = PreparedRequest {
            url: self.resolve(path)?,
            method,
            body,
        };

        let mut state = RequestState::Sending;
        loop {
            debug!("{} {}: {:?}", request.method, request.url.path(), state);
            state = match state {
                RequestState::Sending => {
                    let token = self.session.get();
                    let response = self.send(&request, token.as_deref()).await?;
                    if is_auth_failure(response.status()) {
                        RequestState::AwaitingRefresh
                    } else {
                        RequestState::Done(response)
                    }
                }
                RequestState::AwaitingRefresh => self.refresh().await,
                RequestState::Retrying { token } => {
                    // Whatever comes back is terminal, including another 401/403
                    let response = self.send(&request, Some(&token)).await?;
                    RequestState::Done(response)
                }
                RequestState::Done(response) => return finish(response, mode).await,
                RequestState::Failed(err) => return Err(err),
            };
        }
    }

    async fn refresh(&self) -> RequestState {
        match self.provider.force_refresh().await {
            Ok(Some(token)) => match self.session.replace_token(&token) {
                Ok(()) => {
                    self.session.events().publish(AuthEvent::TokenRefreshed {
                        token: token.clone(),
                    });
                    RequestState::Retrying { token }
                }
                Err(e) => {
                    warn!("Could not persist refreshed token: {}", e);
                    self.expire_session();
                    RequestState::Failed(RequestError::SessionExpired.into())
                }
            },
            Ok(None) => {
                debug!("Identity provider returned no token");
                self.expire_session();
                RequestState::Failed(RequestError::SessionExpired.into())
            }
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                self.expire_session();
                RequestState::Failed(RequestError::SessionExpired.into())
            }
        }
    }

    fn expire_session(&self) {
        if let Err(e) = self.session.clear() {
            warn!("Failed to clear session: {}", e);
        }

        let handler = self
            .on_session_expired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    async fn send(
        &self,
        request: &PreparedRequest,
        token: Option<&str>,
    ) -> std::result::Result<Response, RequestError> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .header(CONTENT_TYPE, "application/json");

        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        Ok(builder.send().await?)
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| RequestError::InvalidResponse(format!("Invalid path '{}': {}", path, e)).into())
    }
}

/// Parse a base URL, ensuring relative paths join under it rather than replace its last segment.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| ConfigError::Invalid(format!("Invalid API URL '{}': {}", base_url, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn finish(response: Response, mode: ResponseMode) -> Result<Payload> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = server_message(&body)
            .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));
        return Err(RequestError::Status {
            status: status.as_u16(),
            message,
        }
        .into());
    }

    let bytes = response.bytes().await.map_err(RequestError::from)?;
    match mode {
        ResponseMode::Binary => Ok(Payload::Binary(bytes.to_vec())),
        ResponseMode::Json if bytes.iter().all(u8::is_ascii_whitespace) => {
            Ok(Payload::Json(Value::Null))
        }
        ResponseMode::Json => serde_json::from_slice(&bytes)
            .map(Payload::Json)
            .map_err(|e| {
                RequestError::InvalidResponse(format!("Failed to parse response: {}", e)).into()
            }),
    }
}

/// Pull a human-readable message out of an error body.
fn server_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
        return Some(trimmed.to_string());
    };

    if let Some(message) = json.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }

    match json.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(error) => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => None,
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        RequestError::InvalidResponse(format!("Unexpected response shape: {}", e)).into()
    })
}
