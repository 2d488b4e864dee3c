//! Mock identity provider for testing
//!
//! Scripts the outcome of each forced refresh without contacting a real
//! identity service, and counts how often a refresh was requested.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::identity::IdentityProvider;
use crate::error::{Result, SessionError};

/// Scripted outcome of one refresh
#[derive(Debug, Clone)]
enum Outcome {
    Token(String),
    Nothing,
    Failure(String),
}

/// Mock provider for testing.
///
/// Outcomes are consumed in order; once the script runs out every further
/// refresh yields no token.
///
/// # Example
/// ```ignore
/// let provider = MockIdentityProvider::new().with_token("fresh");
/// assert_eq!(provider.force_refresh().await?, Some("fresh".to_string()));
/// assert_eq!(provider.calls(), 1);
/// ```
#[derive(Default)]
pub struct MockIdentityProvider {
    script: Mutex<VecDeque<Outcome>>,
    calls: AtomicUsize,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next refresh yields `token`
    pub fn with_token(self, token: &str) -> Self {
        self.push(Outcome::Token(token.to_string()))
    }

    /// Next refresh yields no token
    pub fn with_nothing(self) -> Self {
        self.push(Outcome::Nothing)
    }

    /// Next refresh fails with `message`
    pub fn with_failure(self, message: &str) -> Self {
        self.push(Outcome::Failure(message.to_string()))
    }

    /// Number of refreshes requested so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, outcome: Outcome) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn force_refresh(&self) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Outcome::Nothing);

        match next {
            Outcome::Token(token) => Ok(Some(token)),
            Outcome::Nothing => Ok(None),
            Outcome::Failure(message) => Err(SessionError::Provider(message).into()),
        }
    }
}
