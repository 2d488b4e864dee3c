//! Mock admin API for testing the batch revoker

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::admin::{AdminApi, UserRecord};
use crate::error::{Result, RevocationError};

/// In-memory [`AdminApi`] that fails for chosen uids and records concurrency
#[derive(Default)]
pub struct MockAdminApi {
    failing: HashSet<String>,
    revoke_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockAdminApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revocation of `uid` fails
    pub fn failing(mut self, uid: &str) -> Self {
        self.failing.insert(uid.to_string());
        self
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Highest number of revocations observed in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdminApi for MockAdminApi {
    async fn revoke_refresh_tokens(&self, uid: &str) -> Result<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Let sibling revocations in the same chunk start
        tokio::task::yield_now().await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.contains(uid) {
            return Err(RevocationError::Api {
                status: 500,
                message: format!("revocation of {} rejected", uid),
            }
            .into());
        }
        Ok(())
    }

    async fn get_user(&self, uid: &str) -> Result<UserRecord> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UserRecord {
            uid: uid.to_string(),
            email: Some(format!("{}@campus.edu", uid)),
            tokens_valid_after: DateTime::<Utc>::from_timestamp(1_700_000_000, 0),
        })
    }
}
