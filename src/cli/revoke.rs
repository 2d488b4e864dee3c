//! `revoke-sessions`: bulk refresh-token revocation

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tabled::Tabled;

use crate::config::Config;
use crate::error::Result;
use crate::output::table::format_table;
use crate::revoke::{
    BatchRevoker, ExitStatus, IdentityToolkitClient, ItemOutcome, RevocationObserver,
    RevocationReport, collect_uids,
};

/// Revoke the sessions of many users at once
#[derive(Parser, Debug)]
#[command(name = "revoke-sessions")]
#[command(version, about, long_about = None)]
pub struct RevokeCli {
    /// Comma-separated user ids
    #[arg(long)]
    pub uids: Option<String>,

    /// File with one user id per line
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Users revoked concurrently per batch [default: 20]
    #[arg(long = "batchSize")]
    pub batch_size: Option<usize>,

    /// Pause between batches in milliseconds [default: 250]
    #[arg(long = "delayMs")]
    pub delay_ms: Option<u64>,

    /// Service account key file (defaults to GOOGLE_APPLICATION_CREDENTIALS)
    #[arg(long = "serviceAccount")]
    pub service_account: Option<PathBuf>,

    /// Override config file location
    #[arg(long, env = "CAMPUSWATCH_CONFIG", hide_env = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "CAMPUSWATCH_DEBUG", hide_env = true)]
    pub debug: bool,
}

/// Run the job and report. Empty input is checked first. Errors before the
/// first revocation (bad config, missing credentials) are returned; per-user failures only affect the status.
pub async fn run(args: &RevokeCli) -> Result<ExitStatus> {
    let uids = collect_uids(args.uids.as_deref(), args.file.as_deref())?;
    if uids.is_empty() {
        eprintln!(
            "{} No user ids given. Pass --uids=<a,b,c> or --file=<path>.",
            "✗".red()
        );
        return Ok(ExitStatus::NoInput);
    }

    let config = Config::load_at(args.config.as_deref())?;

    let options = config.revocation.options(args.batch_size, args.delay_ms);
    let service_account = args
        .service_account
        .as_deref()
        .or(config.revocation.service_account.as_deref());
    let api = IdentityToolkitClient::from_env(service_account)?;

    eprintln!(
        "Revoking {} user(s) in project {} (batch size {}, delay {}ms)",
        uids.len(),
        api.project_id().bold(),
        options.batch_size,
        options.delay.as_millis()
    );

    let revoker = BatchRevoker::new(api, options);
    let mut progress = ConsoleProgress::new(uids.len());
    let report = revoker.run(&uids, &mut progress).await;
    progress.finish();

    print_summary(&report);
    Ok(report.exit_status())
}

/// Progress bar on stderr plus one result line per user on stdout
struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RevocationObserver for ConsoleProgress {
    fn chunk_started(&mut self, index: usize, total: usize, _size: usize) {
        self.bar.set_message(format!("batch {}/{}", index + 1, total));
    }

    fn item_finished(&mut self, outcome: &ItemOutcome) {
        self.bar.suspend(|| println!("{}", outcome_line(outcome)));
        self.bar.inc(1);
    }
}

fn outcome_line(outcome: &ItemOutcome) -> String {
    match &outcome.result {
        Ok(user) => match user.tokens_valid_after {
            Some(at) => format!(
                "{} {} (tokens valid after {})",
                "✓".green(),
                outcome.uid,
                at.to_rfc3339()
            ),
            None => format!("{} {}", "✓".green(), outcome.uid),
        },
        Err(reason) => format!("{} {}: {}", "✗".red(), outcome.uid, reason),
    }
}

#[derive(Tabled)]
struct FailureRow {
    #[tabled(rename = "UID")]
    uid: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

fn failure_rows(report: &RevocationReport) -> Vec<FailureRow> {
    report
        .failures()
        .map(|o| FailureRow {
            uid: o.uid.clone(),
            reason: o.result.as_ref().err().cloned().unwrap_or_default(),
        })
        .collect()
}

fn print_summary(report: &RevocationReport) {
    println!();
    println!(
        "Done. Success: {}, Failed: {}",
        report.success_count(),
        report.failure_count()
    );

    let rows = failure_rows(report);
    if !rows.is_empty() {
        println!();
        println!("{}", format_table(&rows, ""));
    }
}

/// Run and map the outcome onto the process exit code. Setup errors count
/// as failures.
pub async fn main_with(args: RevokeCli) -> i32 {
    crate::cli::init_logging(args.debug);
    match run(&args).await {
        Ok(status) => status.code(),
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitStatus::Failures.code()
        }
    }
}
