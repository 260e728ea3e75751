//! Configuration view and initialization commands: `evolve config`.

use anyhow::{Context, Result};
use std::path::Path;

use evolve::config::{CONFIG_FILE_NAME, Config, EvolveToml};

use super::super::ConfigCommands;

pub fn cmd_config(state_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = state_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; using defaults.", config_path.display());
            }
            println!();

            let config = Config::load(state_dir)?;
            println!("[agent]");
            println!(
                "  command = \"{}\" {}",
                config.agent.command,
                config.agent.args.join(" ")
            );
            println!("  timeout_secs = {}", config.agent.timeout_secs);
            println!("  completion_marker = \"{}\"", config.agent.completion_marker);
            println!("[retry]");
            println!("  max_retries = {}", config.retry.max_retries);
            println!("[session]");
            println!("  lock_timeout_ms = {}", config.session.lock_timeout_ms);
            println!("  max_id_len = {}", config.session.max_id_len);
            println!("[verification]");
            if config.verification.test_command.is_empty() {
                println!("  test_command = (none)");
            } else {
                println!(
                    "  test_command = {}",
                    config.verification.test_command.join(" ")
                );
            }
            println!(
                "  required_sections = {}",
                config.verification.required_sections.join(", ")
            );
            println!(
                "  min_acceptance_items = {}",
                config.verification.min_acceptance_items
            );
            for (name, env) in [
                ("test", &config.environments.test),
                ("production", &config.environments.production),
            ] {
                match env {
                    Some(env) => println!("[environments.{}]\n  path = {}", name, env.path.display()),
                    None => println!("[environments.{}]\n  (not configured)", name),
                }
            }
            println!("[server]");
            println!("  {}:{}", config.server.host, config.server.port);
            println!("  projects_root = {}", config.server.projects_root.display());
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(state_dir)
                .with_context(|| format!("Failed to create {}", state_dir.display()))?;
            let content = toml::to_string_pretty(&EvolveToml::default())
                .context("Failed to render default configuration")?;
            std::fs::write(&config_path, content)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
