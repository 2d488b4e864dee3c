//! Bulk session revocation
//!
//! Exit codes: 0 when every user was revoked, 1 when no user ids were given,
//! 2 when any revocation failed.

use clap::Parser;

use campuswatch::cli::revoke::{RevokeCli, main_with};

#[tokio::main]
async fn main() {
    let code = main_with(RevokeCli::parse()).await;
    std::process::exit(code);
}
