//! Persisted session state: the bearer token and the signed-in user's profile
//!
//! The token and the profile are one logical unit. They are written together,
//! cleared together, and a profile that does not parse is treated as corrupt
//! state and cleared rather than ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};

pub mod events;
pub mod store;

pub use events::{AuthEvent, AuthEventBus, AuthSignal, EventRecorder, SubscriptionId};
pub use store::{FileStore, KeyValueStore, MemoryStore};

/// Storage key holding the bearer token
pub const TOKEN_KEY: &str = "token";

/// Storage key holding the serialized [`SessionUser`]
pub const USER_KEY: &str = "user";

const SESSION_KEYS: [&str; 2] = [TOKEN_KEY, USER_KEY];

/// Profile of the signed-in user, stored next to the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub uid: String,

    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub role: String,

    /// Tenant (city) the user belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_id: Option<String>,
}

/// Injectable session store with change notification.
pub struct SessionService {
    store: Arc<dyn KeyValueStore>,
    events: Arc<AuthEventBus>,
    // Values this service last wrote or observed, for cross-context change detection
    last_seen: Mutex<HashMap<&'static str, Option<String>>>,
}

impl SessionService {
    pub fn new(store: Arc<dyn KeyValueStore>, events: Arc<AuthEventBus>) -> Self {
        let last_seen = SESSION_KEYS
            .iter()
            .map(|key| (*key, store.get(key)))
            .collect();

        Self {
            store,
            events,
            last_seen: Mutex::new(last_seen),
        }
    }

    /// In-memory session with its own bus
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(AuthEventBus::new()))
    }

    pub fn events(&self) -> &Arc<AuthEventBus> {
        &self.events
    }

    /// Current token, if any
    pub fn get(&self) -> Option<String> {
        self.store.get(TOKEN_KEY)
    }

    /// Current profile, if present and well-formed. Never clears.
    pub fn user(&self) -> Option<SessionUser> {
        let raw = self.store.get(USER_KEY)?;
        serde_json::from_str(&raw).ok()
    }

    /// Persist token and profile together
    pub fn set(&self, token: &str, user: &SessionUser) -> Result<()> {
        let user_json = serde_json::to_string(user)?;
        {
            // Held across the write so a concurrent check_storage never sees it as external
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            self.store
                .set_all(&[(TOKEN_KEY, token), (USER_KEY, user_json.as_str())])?;
            last_seen.insert(TOKEN_KEY, Some(token.to_string()));
            last_seen.insert(USER_KEY, Some(user_json));
        }
        debug!("Session stored for user {}", user.uid);
        Ok(())
    }

    /// Swap in a refreshed token, keeping the stored profile.
    ///
    /// Fails with [`SessionError::Corrupt`] when no well-formed profile is
    /// stored; the caller decides whether that ends the session.
    pub fn replace_token(&self, token: &str) -> Result<()> {
        let user = self.user().ok_or_else(|| {
            SessionError::Corrupt("no valid user profile to pair with the refreshed token".into())
        })?;
        self.set(token, &user)
    }

    /// Remove token and profile together and publish `auth-cleared`.
    pub fn clear(&self) -> Result<()> {
        {
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.remove_all(&SESSION_KEYS)?;
            for key in SESSION_KEYS {
                last_seen.insert(key, None);
            }
        }
        debug!("Session cleared");

        self.events.publish(AuthEvent::AuthCleared);
        Ok(())
    }

    /// True iff a token and a well-formed profile are both stored.
    ///
    /// A stored profile that does not parse clears the session as a side effect.
    pub fn is_valid(&self) -> bool {
        let token = self.store.get(TOKEN_KEY);
        let raw_user = self.store.get(USER_KEY);

        let (Some(_), Some(raw_user)) = (token, raw_user) else {
            return false;
        };

        match serde_json::from_str::<SessionUser>(&raw_user) {
            Ok(_) => true,
            Err(e) => {
                warn!("Stored user profile is corrupt, clearing session: {}", e);
                if let Err(e) = self.clear() {
                    warn!("Failed to clear corrupt session: {}", e);
                }
                false
            }
        }
    }

    /// Detect changes made to the session keys by another execution context.
    ///
    /// Publishes one `storage-changed` event per differing key and returns the
    /// changed keys. Writes made through this service are never reported.
    pub fn check_storage(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        {
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            for key in SESSION_KEYS {
                let current = self.store.get(key);
                let previous = last_seen.insert(key, current.clone()).flatten();
                if previous != current {
                    changed.push((key, current));
                }
            }
        }

        for (key, new_value) in &changed {
            debug!("Session key '{}' changed externally", key);
            self.events.publish(AuthEvent::StorageChanged {
                key: (*key).to_string(),
                new_value: new_value.clone(),
            });
        }

        changed.into_iter().map(|(key, _)| key).collect()
    }

    /// Poll storage for external changes every `interval` until the handle is aborted.
    pub fn watch_storage(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.check_storage();
            }
        })
    }
}
