//! CLI command definitions and handlers

use std::path::PathBuf;

use clap::{Parser, Subcommand};
pub use clap_complete::Shell;

pub mod args;
pub mod context;
pub mod request;
pub mod revoke;
pub mod session;
pub mod stream;

pub use args::{GlobalOptions, OutputFormat};
pub use context::CommandContext;

/// CampusWatch session tools
#[derive(Parser, Debug)]
#[command(name = "campuswatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Override config file location
    #[arg(long, global = true, env = "CAMPUSWATCH_CONFIG", hide_env = true)]
    pub config: Option<String>,

    /// Override the API base URL
    #[arg(long, global = true, env = "CAMPUSWATCH_API_URL", hide_env = true)]
    pub api_url: Option<String>,

    /// Override the session file location
    #[arg(long, global = true, env = "CAMPUSWATCH_SESSION_FILE", hide_env = true)]
    pub session_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, env = "CAMPUSWATCH_DEBUG", hide_env = true)]
    pub debug: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a signed-in session
    Login {
        /// ID token (prompted for when omitted)
        #[arg(long)]
        token: Option<String>,

        /// User profile as JSON, or @path to a JSON file
        #[arg(long)]
        user: String,
    },

    /// Clear the stored session
    Logout,

    /// Show session status
    Status {
        /// Output format (pretty, json)
        #[arg(long, default_value = "pretty")]
        format: OutputFormat,
    },

    /// Send one authenticated request
    Request {
        /// HTTP method (GET, POST, ...)
        method: String,

        /// Path relative to the API base URL
        path: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,

        /// Write the raw response body to a file instead of printing JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Follow live event streams until interrupted
    Stream {
        /// Stream paths relative to the API base URL
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Generate shell completions
    #[command(after_help = "\
Examples:
  bash:   campuswatch completion bash > /etc/bash_completion.d/campuswatch
  zsh:    campuswatch completion zsh > \"${fpath[1]}/_campuswatch\"
  fish:   campuswatch completion fish > ~/.config/fish/completions/campuswatch.fish")]
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Initialize `log` output on stderr.
///
/// `--debug` forces debug level; otherwise `RUST_LOG` applies, defaulting to warnings.
pub fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    // Tests may initialize more than once
    let _ = builder.format_timestamp(None).try_init();
}
