//! Process-wide authentication signals
//!
//! Publishing is synchronous: every handler subscribed to the signal at the
//! moment of publication runs before `publish` returns. There is no backlog,
//! so a late subscriber never sees an earlier event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

/// Signal names a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthSignal {
    TokenRefreshed,
    AuthCleared,
    StorageChanged,
}

impl AuthSignal {
    pub const ALL: [AuthSignal; 3] = [
        AuthSignal::TokenRefreshed,
        AuthSignal::AuthCleared,
        AuthSignal::StorageChanged,
    ];

    /// Wire name of the signal
    pub fn name(&self) -> &'static str {
        match self {
            AuthSignal::TokenRefreshed => "token-refreshed",
            AuthSignal::AuthCleared => "auth-cleared",
            AuthSignal::StorageChanged => "storage-changed",
        }
    }
}

/// An event carried on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A forced refresh produced a new token
    TokenRefreshed { token: String },
    /// Token and user were removed together
    AuthCleared,
    /// Another execution context changed a persisted session key
    StorageChanged {
        key: String,
        new_value: Option<String>,
    },
}

impl AuthEvent {
    pub fn signal(&self) -> AuthSignal {
        match self {
            AuthEvent::TokenRefreshed { .. } => AuthSignal::TokenRefreshed,
            AuthEvent::AuthCleared => AuthSignal::AuthCleared,
            AuthEvent::StorageChanged { .. } => AuthSignal::StorageChanged,
        }
    }
}

/// Handle returned by [`AuthEventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    signal: AuthSignal,
    handler: Handler,
}

/// Publish/subscribe channel for [`AuthEvent`]s
#[derive(Default)]
pub struct AuthEventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `signal`
    pub fn subscribe<F>(&self, signal: AuthSignal, handler: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.push(Subscriber {
            id,
            signal,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every current subscriber of its signal.
    pub fn publish(&self, event: AuthEvent) {
        let signal = event.signal();

        // Handlers run outside the lock so they may subscribe or publish themselves
        let handlers: Vec<Handler> = {
            let subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|s| s.signal == signal)
                .map(|s| s.handler.clone())
                .collect()
        };

        debug!(
            "Publishing {} to {} subscriber(s)",
            signal.name(),
            handlers.len()
        );

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, signal: AuthSignal) -> usize {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.iter().filter(|s| s.signal == signal).count()
    }
}

/// Synchronous recorder subscribed to every signal, for tests and diagnostics.
pub struct EventRecorder {
    bus: Arc<AuthEventBus>,
    ids: Vec<SubscriptionId>,
    events: Arc<Mutex<Vec<AuthEvent>>>,
}

impl EventRecorder {
    pub fn attach(bus: Arc<AuthEventBus>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let ids = AuthSignal::ALL
            .iter()
            .map(|signal| {
                let events = events.clone();
                bus.subscribe(*signal, move |event| {
                    events
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(event.clone());
                })
            })
            .collect();

        Self { bus, ids, events }
    }

    /// Everything recorded so far, in publication order
    pub fn events(&self) -> Vec<AuthEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, signal: AuthSignal) -> usize {
        self.events()
            .iter()
            .filter(|e| e.signal() == signal)
            .count()
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        for id in &self.ids {
            self.bus.unsubscribe(*id);
        }
    }
}
