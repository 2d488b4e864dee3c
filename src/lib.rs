//! CampusWatch client session lifecycle
//!
//! Persisted session state with change notification, an HTTP client that
//! refreshes once on 401/403, live streams that reconnect on token rotation,
//! and a batch tool for revoking user sessions.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod output;
pub mod revoke;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
