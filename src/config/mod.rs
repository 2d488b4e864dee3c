//! Configuration management for CampusWatch

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::revoke::{DEFAULT_BATCH_SIZE, DEFAULT_DELAY_MS, RevocationOptions};

/// Application configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the CampusWatch API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Override for the persisted session file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,

    /// Identity provider used for forced refreshes
    #[serde(default, skip_serializing_if = "IdentityConfig::is_empty")]
    pub identity: IdentityConfig,

    /// Defaults for `revoke-sessions`
    #[serde(default, skip_serializing_if = "RevocationConfig::is_empty")]
    pub revocation: RevocationConfig,
}

/// Secure Token service settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Web API key of the identity project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Long-lived refresh token; rotated values are written back here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Alternate Secure Token endpoint (emulators, tests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl IdentityConfig {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevocationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<PathBuf>,
}

impl RevocationConfig {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Merge command-line values over these settings and the built-in defaults
    pub fn options(&self, batch_size: Option<usize>, delay_ms: Option<u64>) -> RevocationOptions {
        RevocationOptions::new(
            batch_size.or(self.batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
            delay_ms.or(self.delay_ms).unwrap_or(DEFAULT_DELAY_MS),
        )
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::Invalid(
            "Could not determine home directory".to_string(),
        ))?;

        Ok(home.join(".campuswatch").join("config.yaml"))
    }

    /// The explicit path when given, else the default one
    pub fn resolve_path(path: Option<&str>) -> Result<PathBuf> {
        match path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Self::default_path(),
        }
    }

    /// Load from `path` or the default location. A missing file yields the
    /// default configuration.
    pub fn load_at(path: Option<&str>) -> Result<Self> {
        Self::load_from(&Self::resolve_path(path)?)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        Ok(config)
    }

    /// Save to `path` or the default location
    pub fn save_at(&self, path: Option<&str>) -> Result<()> {
        self.save_to(&Self::resolve_path(path)?)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SaveError(e.to_string()))?;

        std::fs::write(path, contents)?;

        // The file may hold a refresh token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// API base URL, with `override_url` taking precedence
    pub fn api_url(&self, override_url: Option<&str>) -> Result<String> {
        override_url
            .map(str::to_string)
            .or_else(|| self.api_url.clone())
            .ok_or_else(|| ConfigError::MissingApiUrl.into())
    }
}
