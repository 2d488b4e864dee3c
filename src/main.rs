//! CampusWatch CLI - session tools for the CampusWatch platform

use clap::{CommandFactory, Parser};

use campuswatch::cli::{self, Cli, Commands, GlobalOptions};
use campuswatch::error::Result;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    cli::init_logging(cli.debug);

    let opts = GlobalOptions::from_cli(&cli);

    match cli.command {
        Commands::Login { token, user } => cli::session::login(&opts, token, &user),
        Commands::Logout => cli::session::logout(&opts),
        Commands::Status { format } => cli::session::status(&opts, format),
        Commands::Request {
            method,
            path,
            data,
            output,
        } => {
            cli::request::run(&opts, &method, &path, data.as_deref(), output.as_deref()).await
        }
        Commands::Stream { paths } => cli::stream::run(&opts, &paths).await,
        Commands::Completion { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "campuswatch",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}
