//! Command execution context
//!
//! Loads configuration and wires the persisted session, identity provider and
//! request client the same way for every command.

use std::path::PathBuf;
use std::sync::Arc;

use colored::Colorize;
use log::debug;

use crate::cli::GlobalOptions;
use crate::client::{AuthenticatedClient, IdentityProvider, SecureTokenProvider, UnconfiguredProvider};
use crate::config::Config;
use crate::error::Result;
use crate::session::{AuthEventBus, FileStore, SessionService};

/// Context for command execution
pub struct CommandContext {
    /// Loaded configuration
    pub config: Config,
    /// Session backed by the session file
    pub session: Arc<SessionService>,
    /// Resolved session file location
    pub session_path: PathBuf,
    provider: Option<Arc<SecureTokenProvider>>,
    opts: GlobalOptions,
}

impl CommandContext {
    /// Load config and open the session file
    pub fn new(opts: &GlobalOptions) -> Result<Self> {
        let config = Config::load_at(opts.config_ref())?;

        let session_path = match opts
            .session_file
            .clone()
            .or_else(|| config.session_file.clone())
        {
            Some(path) => path,
            None => FileStore::default_path()?,
        };
        debug!("Using session file {}", session_path.display());

        let store = Arc::new(FileStore::new(session_path.clone()));
        let session = Arc::new(SessionService::new(store, Arc::new(AuthEventBus::new())));

        let provider = match config.identity.api_key.clone() {
            Some(api_key) => Some(Arc::new(SecureTokenProvider::with_endpoint(
                api_key,
                config.identity.refresh_token.clone(),
                config.identity.endpoint.clone(),
            )?)),
            None => None,
        };

        Ok(Self {
            config,
            session,
            session_path,
            provider,
            opts: opts.clone(),
        })
    }

    /// API base URL from the flag or the config file
    pub fn api_url(&self) -> Result<String> {
        self.config.api_url(self.opts.api_url.as_deref())
    }

    /// Request client bound to this session.
    ///
    /// When no identity provider is configured, 401/403 responses end the
    /// session immediately.
    pub fn client(&self) -> Result<AuthenticatedClient> {
        let provider: Arc<dyn IdentityProvider> = match &self.provider {
            Some(provider) => provider.clone() as Arc<dyn IdentityProvider>,
            None => Arc::new(UnconfiguredProvider),
        };

        let client = AuthenticatedClient::new(&self.api_url()?, self.session.clone(), provider)?;
        client.set_session_expired_handler(|| {
            eprintln!(
                "{} Session expired. Run {} to sign in again.",
                "⚠".yellow(),
                "campuswatch login".cyan()
            );
        });
        Ok(client)
    }

    /// Write a rotated refresh token back to the config file
    pub fn save_refresh_token(&mut self) -> Result<()> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };

        let current = provider.refresh_token();
        if current.is_some() && current != self.config.identity.refresh_token {
            debug!("Refresh token rotated, saving config");
            self.config.identity.refresh_token = current;
            self.config.save_at(self.opts.config_ref())?;
        }
        Ok(())
    }
}
