//! Error types for CampusWatch

use thiserror::Error;

/// Result type alias for CampusWatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the library and both binaries
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Revocation(#[from] RevocationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Interactive prompt error: {0}")]
    Dialoguer(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation failed: {0}")]
    Other(String),
}

impl From<dialoguer::Error> for Error {
    fn from(err: dialoguer::Error) -> Self {
        Error::Dialoguer(err.to_string())
    }
}

/// Errors surfaced by the authenticated request client.
///
/// The display text is meant to be shown to people as-is; callers should not
/// need to interpret status codes themselves.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Terminal non-OK response. `message` is the server's own message when it sent one.
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Session expired. Sign in again to continue.")]
    SessionExpired,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    /// HTTP status of a terminal response, if the error came from one
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestError::Network("Request timed out".to_string())
        } else if err.is_connect() {
            RequestError::Network("Failed to connect to server".to_string())
        } else {
            RequestError::Network(err.to_string())
        }
    }
}

/// Persisted session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to persist session: {0}")]
    Storage(String),

    #[error("Stored session is corrupt: {0}")]
    Corrupt(String),

    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("Not signed in")]
    NotSignedIn,
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to save configuration: {0}")]
    SaveError(String),

    #[error("API URL not configured. Set `api_url` in the config file or pass --api-url.")]
    MissingApiUrl,
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Batch revocation errors. Per-item failures are carried as these too, but
/// never abort the surrounding job.
#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("Failed to read identifiers: {0}")]
    Input(String),

    #[error("Service account error: {0}")]
    Credentials(String),

    #[error("Project ID not configured. Use a service account key or set GCLOUD_PROJECT.")]
    MissingProjectId,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Admin API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid admin API response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for RevocationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RevocationError::Network("Request timed out".to_string())
        } else if err.is_connect() {
            RevocationError::Network("Failed to connect to admin API".to_string())
        } else {
            RevocationError::Network(err.to_string())
        }
    }
}
