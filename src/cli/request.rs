//! One-off authenticated requests

use std::path::Path;

use colored::Colorize;
use reqwest::Method;
use serde_json::Value;

use crate::cli::{CommandContext, GlobalOptions};
use crate::error::{Error, Result};

/// Send one request through the authenticated client
pub async fn run(
    opts: &GlobalOptions,
    method: &str,
    path: &str,
    data: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let mut ctx = CommandContext::new(opts)?;
    let client = ctx.client()?;

    let method = parse_method(method)?;
    let body = data
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|e| Error::Other(format!("Invalid --data JSON: {}", e)))?;

    let result = async {
        match output {
            Some(file) => {
                let bytes = client.request_bytes(method, path, body.as_ref()).await?;
                std::fs::write(file, &bytes)?;
                eprintln!(
                    "{} Wrote {} bytes to {}",
                    "✓".green(),
                    bytes.len(),
                    file.display()
                );
            }
            None => {
                let value = client.request(method, path, body.as_ref()).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        }
        Ok::<_, Error>(())
    }
    .await;

    // A refresh may have rotated the refresh token even if the retry failed
    ctx.save_refresh_token()?;
    result
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::Other(format!("Invalid HTTP method: {}", method)))
}
