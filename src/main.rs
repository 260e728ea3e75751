use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use evolve::config::{Config, STATE_DIR_NAME};

mod cmd;

#[derive(Parser)]
#[command(name = "evolve")]
#[command(version, about = "Phase orchestration and evolution pipeline engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// State directory holding evolve.toml, jobs, escalations and sessions
    #[arg(long, global = true, env = "EVOLVE_STATE_DIR", default_value = STATE_DIR_NAME)]
    pub state_dir: PathBuf,

    /// Attempts per phase before escalation (clamped to 1..=10)
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP control API
    Serve {
        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Allow cross-origin requests from any host
        #[arg(long)]
        dev: bool,
    },
    /// Run every phase of a project and stream its events
    Run {
        /// Project directory or manifest file
        project: PathBuf,

        /// Print only the final job summary
        #[arg(short, long)]
        quiet: bool,

        /// Stream raw NDJSON events instead of formatted lines
        #[arg(long)]
        json: bool,
    },
    /// Resume a halted job
    Resume {
        job_id: String,

        /// Phase to restart from (defaults to the first incomplete phase)
        #[arg(long)]
        from_phase: Option<String>,

        /// Reset the named phase and everything after it
        #[arg(long)]
        reset: bool,

        #[arg(short, long)]
        quiet: bool,

        #[arg(long)]
        json: bool,
    },
    /// Show one job, or list all jobs
    Status {
        job_id: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Cancel a job
    Cancel { job_id: String },
    /// List or resolve escalations
    Escalations {
        #[command(subcommand)]
        command: Option<EscalationCommands>,
    },
    /// Drive the evolution pipeline for a project
    Evolution {
        #[command(subcommand)]
        command: EvolutionCommands,
    },
    /// Conversational sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Retire a project into the archive
    Archive {
        /// Project directory or manifest file
        project: PathBuf,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum EscalationCommands {
    /// List every escalation
    List {
        /// Only show unresolved escalations
        #[arg(long)]
        open: bool,
    },
    /// Mark an escalation resolved so its job can be resumed
    Resolve {
        job_id: String,
        phase_id: String,
        #[arg(short, long)]
        note: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum EvolutionCommands {
    /// Show the pipeline position of a project
    Status { project: String },
    /// Install the project's artifacts into the test environment
    Deploy { project: String },
    /// Run validation against the test environment
    Validate { project: String },
    /// Promote validated artifacts into production
    Integrate { project: String },
    /// Restore every environment this promotion changed
    Rollback { project: String },
}

#[derive(Subcommand, Clone)]
pub enum SessionCommands {
    /// Open (or continue) a session and append a message
    Open {
        #[arg(long)]
        correlation_id: Option<String>,
        message: String,
    },
    /// Append a message to an existing session
    Append {
        session_id: String,
        content: String,
        #[arg(long, default_value = "user")]
        role: String,
    },
    /// Print a session
    Show { session_id: String },
    /// Archive sessions idle for longer than the given age
    Archive {
        #[arg(long, default_value = "86400")]
        max_age_secs: u64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default evolve.toml
    Init,
}

fn init_tracing(cli: &Cli) {
    let fallback = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("EVOLVE_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.state_dir)
        .with_context(|| format!("Failed to load configuration from {}", cli.state_dir.display()))?;
    if let Some(n) = cli.max_retries {
        config.set_max_retries(n);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    // `config` reads the state directory itself.
    let config = match &cli.command {
        Commands::Config { command } => return cmd::cmd_config(&cli.state_dir, command.clone()),
        _ => load_config(&cli)?,
    };

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, *port, host.clone(), *dev).await?;
        }
        Commands::Run {
            project,
            quiet,
            json,
        } => {
            cmd::cmd_run(config, project, cmd::OutputMode::new(*quiet, *json)).await?;
        }
        Commands::Resume {
            job_id,
            from_phase,
            reset,
            quiet,
            json,
        } => {
            cmd::cmd_resume(
                config,
                job_id,
                from_phase.as_deref(),
                *reset,
                cmd::OutputMode::new(*quiet, *json),
            )
            .await?;
        }
        Commands::Status { job_id, json } => cmd::cmd_status(config, job_id.as_deref(), *json)?,
        Commands::Cancel { job_id } => cmd::cmd_cancel(config, job_id)?,
        Commands::Escalations { command } => cmd::cmd_escalations(config, command.clone())?,
        Commands::Evolution { command } => cmd::cmd_evolution(&config, command.clone()).await?,
        Commands::Session { command } => cmd::cmd_session(&config, command.clone()).await?,
        Commands::Archive { project } => cmd::cmd_archive(&config, project)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
