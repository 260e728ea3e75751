//! Session commands: `evolve session`.

use anyhow::Result;
use std::time::Duration;

use evolve::config::Config;
use evolve::session::{SessionState, SessionStore};

use super::super::SessionCommands;

pub async fn cmd_session(config: &Config, command: SessionCommands) -> Result<()> {
    let store = SessionStore::new(config.sessions_dir(), &config.session);

    match command {
        SessionCommands::Open {
            correlation_id,
            message,
        } => {
            let handle = store
                .get_or_create(correlation_id.as_deref(), &message)
                .await?;
            let verb = if handle.created { "Created" } else { "Continued" };
            println!("{} session {}", verb, console::style(&handle.session_id).bold());
            if handle.degraded {
                println!(
                    "  {}",
                    console::style("lock contended; issued a fresh session").yellow()
                );
            }
            print_state(&handle.state);
        }
        SessionCommands::Append {
            session_id,
            content,
            role,
        } => {
            let state = store.append_message(&session_id, &role, &content).await?;
            print_state(&state);
        }
        SessionCommands::Show { session_id } => {
            let state = store.get(&session_id)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        SessionCommands::Archive { max_age_secs } => {
            let archived = store
                .archive_expired(Duration::from_secs(max_age_secs))
                .await?;
            if archived.is_empty() {
                println!("No sessions older than {}s.", max_age_secs);
            } else {
                println!("Archived {} session(s):", archived.len());
                for id in archived {
                    println!("  {}", id);
                }
            }
        }
    }
    Ok(())
}

fn print_state(state: &SessionState) {
    println!(
        "  {} message(s), updated {}",
        state.messages.len(),
        state.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}
