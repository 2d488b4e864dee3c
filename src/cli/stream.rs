//! Follow live event streams

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::debug;

use crate::cli::{CommandContext, GlobalOptions};
use crate::error::{Error, Result};
use crate::session::{AuthEvent, AuthEventBus, AuthSignal, SubscriptionId, TOKEN_KEY};
use crate::stream::{SseTransport, StreamEvent, StreamManager};

/// How often the session file is checked for changes by other processes
const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Open one stream per path and print events until Ctrl-C
pub async fn run(opts: &GlobalOptions, paths: &[String]) -> Result<()> {
    let ctx = CommandContext::new(opts)?;
    if !ctx.session.is_valid() {
        return Err(crate::error::SessionError::NotSignedIn.into());
    }

    let transport = Arc::new(SseTransport::new()?);
    let manager = StreamManager::new(&ctx.api_url()?, ctx.session.clone(), transport)?;

    let events = ctx.session.events().clone();
    let bridge = bridge_token_changes(&events);
    let cleared = events.subscribe(AuthSignal::AuthCleared, |_| {
        eprintln!(
            "{} Session cleared. Run 'campuswatch login' to sign in again.",
            "⚠".yellow()
        );
    });

    for path in paths {
        let label = path.clone();
        manager.subscribe(path, move |event| print_event(&label, &event))?;
    }
    eprintln!(
        "{} Streaming {} path(s). Press Ctrl-C to stop.",
        "→".cyan(),
        paths.len()
    );

    let watcher = ctx.session.watch_storage(STORAGE_POLL_INTERVAL);
    let interrupted = tokio::signal::ctrl_c().await;

    watcher.abort();
    events.unsubscribe(bridge);
    events.unsubscribe(cleared);
    drop(manager);

    interrupted.map_err(|e| Error::Other(format!("Failed to wait for Ctrl-C: {}", e)))
}

/// Republish a token written by another process as `token-refreshed`, so open
/// streams reconnect with it.
fn bridge_token_changes(events: &Arc<AuthEventBus>) -> SubscriptionId {
    let bus = Arc::downgrade(events);
    events.subscribe(AuthSignal::StorageChanged, move |event| {
        let AuthEvent::StorageChanged {
            key,
            new_value: Some(token),
        } = event
        else {
            return;
        };
        if key != TOKEN_KEY {
            return;
        }
        if let Some(bus) = bus.upgrade() {
            debug!("Token changed in session file, reconnecting streams");
            bus.publish(AuthEvent::TokenRefreshed {
                token: token.clone(),
            });
        }
    })
}

fn print_event(path: &str, event: &StreamEvent) {
    let kind = event.event.as_deref().unwrap_or("message");
    println!("{} {} {}", path.dimmed(), kind.cyan(), event.data);
}
