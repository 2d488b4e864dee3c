//! Batch session revocation
//!
//! Identifiers are split into consecutive chunks of `batch_size`. Each chunk
//! is revoked concurrently, and the revoker sleeps for `delay` between chunks.
//! That pause is the only throttling; there is no backoff. Every identifier
//! gets its own outcome, so one failure never aborts the run.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info};

use crate::error::{Result, RevocationError};

pub mod admin;
pub mod credentials;

#[cfg(test)]
pub mod mock;

pub use admin::{AdminApi, IdentityToolkitClient, UserRecord};
pub use credentials::ServiceAccount;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_DELAY_MS: u64 = 250;

/// Chunking and pacing for a revocation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevocationOptions {
    pub batch_size: usize,
    pub delay: Duration,
}

impl Default for RevocationOptions {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_DELAY_MS)
    }
}

impl RevocationOptions {
    /// A batch size of zero is raised to one
    pub fn new(batch_size: usize, delay_ms: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// Gather target identifiers: inline comma-separated values first, then one
/// per line from `file`. Entries are trimmed and blanks dropped; duplicates
/// are kept so each attempt shows up in the report.
pub fn collect_uids(inline: Option<&str>, file: Option<&Path>) -> Result<Vec<String>> {
    let mut uids: Vec<String> = inline
        .into_iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if let Some(path) = file {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RevocationError::Input(format!("{}: {}", path.display(), e))
        })?;
        uids.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }

    Ok(uids)
}

/// A successfully revoked user
#[derive(Debug, Clone, PartialEq)]
pub struct RevokedUser {
    pub uid: String,
    pub tokens_valid_after: Option<DateTime<Utc>>,
}

/// Result for one identifier. Failures carry a printable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub uid: String,
    pub result: std::result::Result<RevokedUser, String>,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Process exit codes for a revocation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    NoInput = 1,
    Failures = 2,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Default)]
pub struct RevocationReport {
    /// Size of each chunk, in order
    pub chunk_sizes: Vec<usize>,
    /// One entry per input identifier, in input order
    pub outcomes: Vec<ItemOutcome>,
}

impl RevocationReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.outcomes.is_empty() {
            ExitStatus::NoInput
        } else if self.failure_count() > 0 {
            ExitStatus::Failures
        } else {
            ExitStatus::Success
        }
    }
}

/// Progress callbacks for a running job
pub trait RevocationObserver {
    fn chunk_started(&mut self, _index: usize, _total: usize, _size: usize) {}

    fn item_finished(&mut self, _outcome: &ItemOutcome) {}
}

/// Observer that ignores progress
impl RevocationObserver for () {}

/// Runs revocations against an [`AdminApi`]
pub struct BatchRevoker<A> {
    api: A,
    options: RevocationOptions,
}

impl<A: AdminApi> BatchRevoker<A> {
    pub fn new(api: A, options: RevocationOptions) -> Self {
        Self { api, options }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn options(&self) -> RevocationOptions {
        self.options
    }

    /// Revoke every identifier, chunk by chunk
    pub async fn run<O: RevocationObserver>(
        &self,
        uids: &[String],
        observer: &mut O,
    ) -> RevocationReport {
        let mut report = RevocationReport::default();
        let total = uids.len().div_ceil(self.options.batch_size);

        for (index, chunk) in uids.chunks(self.options.batch_size).enumerate() {
            debug!("Chunk {}/{}: {} identifiers", index + 1, total, chunk.len());
            observer.chunk_started(index, total, chunk.len());

            let outcomes = join_all(chunk.iter().map(|uid| self.revoke_one(uid))).await;
            for outcome in outcomes {
                observer.item_finished(&outcome);
                report.outcomes.push(outcome);
            }
            report.chunk_sizes.push(chunk.len());

            if index + 1 < total && !self.options.delay.is_zero() {
                tokio::time::sleep(self.options.delay).await;
            }
        }

        info!(
            "Revocation finished: {} succeeded, {} failed",
            report.success_count(),
            report.failure_count()
        );
        report
    }

    /// Revoke then read back the user. Both steps form one unit; neither is
    /// retried on its own.
    async fn revoke_one(&self, uid: &str) -> ItemOutcome {
        let result = async {
            self.api.revoke_refresh_tokens(uid).await?;
            let user = self.api.get_user(uid).await?;
            Ok::<_, crate::error::Error>(RevokedUser {
                uid: user.uid,
                tokens_valid_after: user.tokens_valid_after,
            })
        }
        .await
        .map_err(|e| e.to_string());

        ItemOutcome {
            uid: uid.to_string(),
            result,
        }
    }
}
