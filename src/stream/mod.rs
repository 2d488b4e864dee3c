//! Live-data push subscriptions bound to the current session
//!
//! Each subscription owns exactly one connection. Connections are never
//! retried on error; the only reconnect trigger is a `token-refreshed` event,
//! which closes every connection and opens a new one carrying the new token.
//! Push transports cannot set headers, so the token travels as the `token`
//! query parameter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{debug, warn};
use url::Url;

use crate::client::normalize_base_url;
use crate::error::{RequestError, Result, SessionError};
use crate::session::{AuthEvent, AuthSignal, SessionService, SubscriptionId};

pub mod sse;

pub use sse::{SseParser, SseTransport};

/// Query parameter carrying the bearer token
pub const TOKEN_PARAM: &str = "token";

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// A message pushed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Event type; `None` is the default "message" type
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

pub type StreamHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Shared view of a connection's state, updated by the transport
#[derive(Debug, Clone)]
pub struct ConnectionStatus(Arc<Mutex<ConnectionState>>);

impl ConnectionStatus {
    pub fn new(state: ConnectionState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, state: ConnectionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Opens push connections
pub trait StreamTransport: Send + Sync {
    /// Start connecting to `url`. The transport moves `status` to `Open` once
    /// connected and to `Closed` when the connection ends or fails, and calls
    /// `handler` for every received event.
    fn open(
        &self,
        url: Url,
        handler: StreamHandler,
        status: ConnectionStatus,
    ) -> Box<dyn StreamConnection>;
}

/// Handle to one open connection
pub trait StreamConnection: Send {
    /// Tear the connection down. Idempotent.
    fn close(&mut self);
}

/// Identifier of a subscription within one [`StreamManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

struct ActiveSubscription {
    path: String,
    handler: StreamHandler,
    connection: Box<dyn StreamConnection>,
    status: ConnectionStatus,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: BTreeMap<StreamId, ActiveSubscription>,
}

struct Inner {
    base_url: Url,
    transport: Arc<dyn StreamTransport>,
    registry: Mutex<Registry>,
}

impl Inner {
    fn connect(
        &self,
        path: &str,
        token: &str,
        handler: &StreamHandler,
    ) -> Result<(Box<dyn StreamConnection>, ConnectionStatus)> {
        let url = stream_url(&self.base_url, path, token)?;
        let status = ConnectionStatus::new(ConnectionState::Opening);
        let connection = self.transport.open(url, handler.clone(), status.clone());
        Ok((connection, status))
    }

    /// Replace every connection with one carrying `token`
    fn reconnect_all(&self, token: &str) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(
            "Token refreshed, reconnecting {} stream(s)",
            registry.subscriptions.len()
        );

        for (id, subscription) in registry.subscriptions.iter_mut() {
            subscription.connection.close();
            subscription.status.set(ConnectionState::Closed);

            match self.connect(&subscription.path, token, &subscription.handler) {
                Ok((connection, status)) => {
                    subscription.connection = connection;
                    subscription.status = status;
                }
                Err(e) => warn!("Failed to reopen stream {:?}: {}", id, e),
            }
        }
    }
}

/// Owns every live subscription and follows token rotation
pub struct StreamManager {
    inner: Arc<Inner>,
    session: Arc<SessionService>,
    bus_subscription: SubscriptionId,
}

impl StreamManager {
    pub fn new(
        base_url: &str,
        session: Arc<SessionService>,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            base_url: normalize_base_url(base_url)?,
            transport,
            registry: Mutex::new(Registry::default()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let bus_subscription =
            session
                .events()
                .subscribe(AuthSignal::TokenRefreshed, move |event| {
                    if let (Some(inner), AuthEvent::TokenRefreshed { token }) =
                        (weak.upgrade(), event)
                    {
                        inner.reconnect_all(token);
                    }
                });

        Ok(Self {
            inner,
            session,
            bus_subscription,
        })
    }

    /// Open a subscription to `path` with the current token
    pub fn subscribe<F>(&self, path: &str, handler: F) -> Result<StreamId>
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        // Locked before reading the token so a concurrent refresh waits for the insert
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let token = self.session.get().ok_or(SessionError::NotSignedIn)?;
        let handler: StreamHandler = Arc::new(handler);
        let (connection, status) = self.inner.connect(path, &token, &handler)?;

        let id = StreamId(registry.next_id);
        registry.next_id += 1;
        registry.subscriptions.insert(
            id,
            ActiveSubscription {
                path: path.to_string(),
                handler,
                connection,
                status,
            },
        );
        debug!("Subscribed {:?} to {}", id, path);
        Ok(id)
    }

    /// Close and forget a subscription. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: StreamId) -> bool {
        let removed = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .remove(&id);

        match removed {
            Some(mut subscription) => {
                subscription.connection.close();
                subscription.status.set(ConnectionState::Closed);
                debug!("Unsubscribed {:?}", id);
                true
            }
            None => false,
        }
    }

    /// Current connection state, `None` once unsubscribed
    pub fn state(&self, id: StreamId) -> Option<ConnectionState> {
        let registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry.subscriptions.get(&id).map(|s| s.status.get())
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .len()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.session.events().unsubscribe(self.bus_subscription);
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for subscription in registry.subscriptions.values_mut() {
            subscription.connection.close();
            subscription.status.set(ConnectionState::Closed);
        }
        registry.subscriptions.clear();
    }
}

/// Join `path` onto `base` and set the token parameter, replacing any existing one.
pub fn stream_url(base: &Url, path: &str, token: &str) -> Result<Url> {
    let mut url = base.join(path.trim_start_matches('/')).map_err(|e| {
        RequestError::InvalidResponse(format!("Invalid stream path '{}': {}", path, e))
    })?;

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != TOKEN_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(TOKEN_PARAM, token);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionUser;

    /// Transport that records opens and closes instead of connecting
    #[derive(Default)]
    struct RecordingTransport {
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingConnection {
        url: Url,
        log: Arc<Mutex<Vec<String>>>,
        status: ConnectionStatus,
        closed: bool,
    }

    impl StreamTransport for RecordingTransport {
        fn open(
            &self,
            url: Url,
            _handler: StreamHandler,
            status: ConnectionStatus,
        ) -> Box<dyn StreamConnection> {
            self.log.lock().unwrap().push(format!("open {}", url));
            status.set(ConnectionState::Open);
            Box::new(RecordingConnection {
                url,
                log: self.log.clone(),
                status,
                closed: false,
            })
        }
    }

    impl StreamConnection for RecordingConnection {
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.status.set(ConnectionState::Closed);
                self.log.lock().unwrap().push(format!("close {}", self.url));
            }
        }
    }

    impl RecordingTransport {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn session(token: &str) -> Arc<SessionService> {
        let session = Arc::new(SessionService::in_memory());
        let user = SessionUser {
            uid: "u-1".to_string(),
            email: "ada@campus.edu".to_string(),
            display_name: None,
            role: "staff".to_string(),
            city_id: None,
        };
        session.set(token, &user).unwrap();
        session
    }

    #[test]
    fn test_stream_url_sets_and_replaces_token() {
        let base = normalize_base_url("https://api.campus.edu").unwrap();

        let url = stream_url(&base, "/api/issues/stream", "abc").unwrap();
        assert_eq!(url.as_str(), "https://api.campus.edu/api/issues/stream?token=abc");

        let url = stream_url(&base, "/api/heatmap/stream?city=sf&token=old", "n w").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.campus.edu/api/heatmap/stream?city=sf&token=n+w"
        );
    }

    /// Transport whose first open triggers a token refresh on another thread
    struct RefreshingTransport {
        session: Arc<SessionService>,
        inner: RecordingTransport,
        refresher: Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    impl StreamTransport for RefreshingTransport {
        fn open(
            &self,
            url: Url,
            handler: StreamHandler,
            status: ConnectionStatus,
        ) -> Box<dyn StreamConnection> {
            let mut refresher = self.refresher.lock().unwrap();
            if refresher.is_none() {
                let session = self.session.clone();
                *refresher = Some(std::thread::spawn(move || {
                    session.replace_token("t2").unwrap();
                    session.events().publish(AuthEvent::TokenRefreshed {
                        token: "t2".to_string(),
                    });
                }));
            }
            self.inner.open(url, handler, status)
        }
    }

    #[test]
    fn test_refresh_during_subscribe_reaches_new_subscription() {
        let session = session("t1");
        let transport = Arc::new(RefreshingTransport {
            session: session.clone(),
            inner: RecordingTransport::default(),
            refresher: Mutex::new(None),
        });
        let manager =
            StreamManager::new("http://push.local", session, transport.clone()).unwrap();

        let id = manager.subscribe("/live/issues", |_| {}).unwrap();
        let refresher = transport.refresher.lock().unwrap().take().unwrap();
        refresher.join().unwrap();

        assert_eq!(manager.state(id), Some(ConnectionState::Open));
        assert_eq!(
            transport.inner.entries().last().map(String::as_str),
            Some("open http://push.local/live/issues?token=t2")
        );
    }

    #[test]
    fn test_subscribe_opens_with_current_token() {
        let transport = Arc::new(RecordingTransport::default());
        let manager =
            StreamManager::new("http://push.local", session("t1"), transport.clone()).unwrap();

        let id = manager.subscribe("/live/issues", |_| {}).unwrap();
        assert_eq!(manager.state(id), Some(ConnectionState::Open));
        assert_eq!(
            transport.entries(),
            vec!["open http://push.local/live/issues?token=t1"]
        );
    }

    #[test]
    fn test_subscribe_requires_token() {
        let transport = Arc::new(RecordingTransport::default());
        let manager = StreamManager::new(
            "http://push.local",
            Arc::new(SessionService::in_memory()),
            transport.clone(),
        )
        .unwrap();

        assert!(manager.subscribe("/live/issues", |_| {}).is_err());
        assert!(transport.entries().is_empty());
    }

    #[test]
    fn test_token_refresh_reconnects_each_subscription_once() {
        let session = session("t1");
        let transport = Arc::new(RecordingTransport::default());
        let manager =
            StreamManager::new("http://push.local", session.clone(), transport.clone()).unwrap();

        let a = manager.subscribe("/live/a", |_| {}).unwrap();
        let b = manager.subscribe("/live/b", |_| {}).unwrap();

        session.events().publish(AuthEvent::TokenRefreshed {
            token: "t2".to_string(),
        });

        assert_eq!(
            transport.entries(),
            vec![
                "open http://push.local/live/a?token=t1",
                "open http://push.local/live/b?token=t1",
                "close http://push.local/live/a?token=t1",
                "open http://push.local/live/a?token=t2",
                "close http://push.local/live/b?token=t1",
                "open http://push.local/live/b?token=t2",
            ]
        );
        assert_eq!(manager.state(a), Some(ConnectionState::Open));
        assert_eq!(manager.state(b), Some(ConnectionState::Open));
    }

    #[test]
    fn test_other_signals_do_not_reconnect() {
        let session = session("t1");
        let transport = Arc::new(RecordingTransport::default());
        let manager =
            StreamManager::new("http://push.local", session.clone(), transport.clone()).unwrap();
        manager.subscribe("/live/a", |_| {}).unwrap();

        session.events().publish(AuthEvent::StorageChanged {
            key: "token".to_string(),
            new_value: None,
        });
        session.clear().unwrap();

        assert_eq!(transport.entries().len(), 1);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_unsubscribe_closes_without_reopening() {
        let session = session("t1");
        let transport = Arc::new(RecordingTransport::default());
        let manager =
            StreamManager::new("http://push.local", session.clone(), transport.clone()).unwrap();

        let id = manager.subscribe("/live/a", |_| {}).unwrap();
        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        assert_eq!(manager.state(id), None);

        session.events().publish(AuthEvent::TokenRefreshed {
            token: "t2".to_string(),
        });
        assert_eq!(
            transport.entries(),
            vec![
                "open http://push.local/live/a?token=t1",
                "close http://push.local/live/a?token=t1",
            ]
        );
    }

    #[test]
    fn test_drop_detaches_from_bus_and_closes() {
        let session = session("t1");
        let transport = Arc::new(RecordingTransport::default());
        {
            let manager =
                StreamManager::new("http://push.local", session.clone(), transport.clone())
                    .unwrap();
            manager.subscribe("/live/a", |_| {}).unwrap();
            assert_eq!(session.events().subscriber_count(AuthSignal::TokenRefreshed), 1);
        }

        assert_eq!(session.events().subscriber_count(AuthSignal::TokenRefreshed), 0);
        assert_eq!(transport.entries().last().unwrap(), "close http://push.local/live/a?token=t1");
    }
}
