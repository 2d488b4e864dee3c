//! Login, logout and status commands

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use colored::Colorize;
use dialoguer::{Password, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};

use crate::cli::{CommandContext, GlobalOptions, OutputFormat};
use crate::error::{Error, Result};
use crate::output::formatters::{format_datetime_local, format_remaining};
use crate::output::json::format_json;
use crate::session::SessionUser;

/// Store a session as the sign-in flow would
pub fn login(opts: &GlobalOptions, token: Option<String>, user: &str) -> Result<()> {
    let ctx = CommandContext::new(opts)?;
    let user = parse_user(user)?;

    let token = match token {
        Some(token) => token,
        None => Password::with_theme(&ColorfulTheme::default())
            .with_prompt("Enter your ID token")
            .interact()?,
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::Other("Token must not be empty".to_string()));
    }

    ctx.session.set(token, &user)?;

    println!(
        "{} Signed in as {} ({})",
        "✓".green(),
        user.email.bold(),
        user.role
    );
    println!("  Session file: {}", ctx.session_path.display());
    Ok(())
}

/// Clear the session
pub fn logout(opts: &GlobalOptions) -> Result<()> {
    let ctx = CommandContext::new(opts)?;
    ctx.session.clear()?;
    println!("{} Signed out", "✓".green());
    Ok(())
}

#[derive(Debug, Serialize)]
struct SessionStatus {
    signed_in: bool,
    session_file: String,
    user: Option<SessionUser>,
    token_expires_at: Option<DateTime<Utc>>,
}

/// Show whether a valid session is stored. Corrupt state is cleared.
pub fn status(opts: &GlobalOptions, format: OutputFormat) -> Result<()> {
    let ctx = CommandContext::new(opts)?;

    let signed_in = ctx.session.is_valid();
    let status = SessionStatus {
        signed_in,
        session_file: ctx.session_path.display().to_string(),
        user: if signed_in { ctx.session.user() } else { None },
        token_expires_at: if signed_in {
            ctx.session.get().as_deref().and_then(token_expiry)
        } else {
            None
        },
    };

    match format {
        OutputFormat::Json => println!("{}", format_json(&status)?),
        OutputFormat::Pretty => print_status(&status),
    }
    Ok(())
}

fn print_status(status: &SessionStatus) {
    println!("{}\n", "CampusWatch Session Status".bold());
    println!("Session file: {}", status.session_file.cyan());
    println!();

    let Some(user) = status.user.as_ref() else {
        println!("{} Not signed in", "✗".red());
        println!("  → Run 'campuswatch login' to store a session");
        println!();
        return;
    };

    println!("{} Signed in as {}", "✓".green(), user.email.bold());
    if let Some(name) = &user.display_name {
        println!("  Name: {}", name);
    }
    println!("  UID: {}", user.uid);
    println!("  Role: {}", user.role);
    if let Some(city) = &user.city_id {
        println!("  City: {}", city);
    }

    // Informational only: the backend decides when the token is rejected
    match status.token_expires_at {
        Some(at) => match format_remaining(at, Utc::now()) {
            Some(left) => println!(
                "{} Token expires in {} ({})",
                "✓".green(),
                left,
                format_datetime_local(at)
            ),
            None => println!(
                "{} Token expired at {} (will refresh on next request)",
                "⚠".yellow(),
                format_datetime_local(at)
            ),
        },
        None => println!("{} Token expiry unknown", "○".dimmed()),
    }
    println!();
}

/// Parse `--user`: inline JSON, or `@path` to a JSON file
fn parse_user(arg: &str) -> Result<SessionUser> {
    let json = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    serde_json::from_str(&json)
        .map_err(|e| Error::Other(format!("Invalid user profile: {}", e)))
}

#[derive(Deserialize)]
struct TokenClaims {
    exp: i64,
}

/// Expiry claim of a JWT, if the token is one
fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: TokenClaims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp, 0)
}
