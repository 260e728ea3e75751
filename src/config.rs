//! Runtime configuration for evolve.
//!
//! Settings are layered: built-in defaults, then `<state_dir>/evolve.toml`,
//! then environment variables, then CLI flags (applied by the caller).
//!
//! ```toml
//! [agent]
//! command = "claude"
//! args = ["--print", "--output-format", "stream-json"]
//! timeout_secs = 1800
//! completion_marker = ".phase-complete"
//!
//! [retry]
//! max_retries = 3
//!
//! [session]
//! lock_timeout_ms = 5000
//! max_id_len = 64
//!
//! [verification]
//! test_command = ["pytest", "-q"]
//! test_timeout_secs = 600
//! required_sections = ["Summary", "Motivation", "Acceptance Criteria"]
//! min_acceptance_items = 3
//!
//! [environments.test]
//! path = "/srv/test"
//! restart = ["systemctl", "restart", "app-test"]
//!
//! [environments.production]
//! path = "/srv/prod"
//! restart = ["systemctl", "restart", "app"]
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! projects_root = "projects"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the state directory created under the working directory.
pub const STATE_DIR_NAME: &str = ".evolve";

/// Name of the configuration file inside the state directory.
pub const CONFIG_FILE_NAME: &str = "evolve.toml";

/// Hard ceiling on the per-workflow retry budget.
pub const MAX_RETRIES_CEILING: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Program used to launch the coding agent.
    pub command: String,
    /// Fixed arguments placed before the instruction document path.
    pub args: Vec<String>,
    /// Wall-clock timeout for one agent attempt.
    pub timeout_secs: u64,
    /// File the agent's end-of-session hook writes once it has truly finished.
    pub completion_marker: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            timeout_secs: 1800,
            completion_marker: ".phase-complete".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts allowed per phase before escalation.
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub lock_timeout_ms: u64,
    pub max_id_len: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            max_id_len: 64,
        }
    }
}

impl SessionSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Default test-runner argv for `tests_pass` gates and the validate stage.
    pub test_command: Vec<String>,
    pub test_timeout_secs: u64,
    /// Default headings required by `structural_document` gates.
    pub required_sections: Vec<String>,
    /// Default minimum number of checklist items in a structural document.
    pub min_acceptance_items: usize,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            test_command: Vec::new(),
            test_timeout_secs: 600,
            required_sections: vec![
                "Summary".to_string(),
                "Motivation".to_string(),
                "Acceptance Criteria".to_string(),
            ],
            min_acceptance_items: 3,
        }
    }
}

/// One deployment target of the evolution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    /// Root of the environment's git working tree.
    pub path: PathBuf,
    /// Argv used to restart the service after artifacts change.
    #[serde(default)]
    pub restart: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentsConfig {
    pub test: Option<EnvironmentSettings>,
    pub production: Option<EnvironmentSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Directory holding one sub-directory per project, addressed by name.
    pub projects_root: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            projects_root: PathBuf::from("projects"),
        }
    }
}

/// Contents of `evolve.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolveToml {
    pub agent: AgentSettings,
    pub retry: RetrySettings,
    pub session: SessionSettings,
    pub verification: VerificationSettings,
    pub environments: EnvironmentsConfig,
    pub server: ServerSettings,
}

impl EvolveToml {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse evolve.toml")
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub agent: AgentSettings,
    pub retry: RetrySettings,
    pub session: SessionSettings,
    pub verification: VerificationSettings,
    pub environments: EnvironmentsConfig,
    pub server: ServerSettings,
}

impl Config {
    /// Load configuration rooted at `state_dir`.
    ///
    /// A missing `evolve.toml` yields defaults. Relative paths in the file
    /// are resolved against the state directory's parent.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE_NAME);
        let toml = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            EvolveToml::parse(&content)
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))?
        } else {
            EvolveToml::default()
        };

        let mut config = Self::from_toml(state_dir.to_path_buf(), toml);
        config.apply_env();
        config.resolve_relative_paths();
        config.clamp();
        Ok(config)
    }

    /// Build a config from parsed TOML without touching the environment.
    pub fn from_toml(state_dir: PathBuf, toml: EvolveToml) -> Self {
        Self {
            state_dir,
            agent: toml.agent,
            retry: toml.retry,
            session: toml.session,
            verification: toml.verification,
            environments: toml.environments,
            server: toml.server,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("EVOLVE_AGENT_CMD")
            && !cmd.trim().is_empty()
        {
            self.agent.command = cmd;
        }
        if let Some(n) = env_parse::<u32>("EVOLVE_MAX_RETRIES") {
            self.retry.max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("EVOLVE_PHASE_TIMEOUT_SECS") {
            self.agent.timeout_secs = secs;
        }
    }

    fn resolve_relative_paths(&mut self) {
        let base = self
            .state_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if self.server.projects_root.is_relative() {
            self.server.projects_root = base.join(&self.server.projects_root);
        }
        for env in [&mut self.environments.test, &mut self.environments.production]
            .into_iter()
            .flatten()
        {
            if env.path.is_relative() {
                env.path = base.join(&env.path);
            }
        }
    }

    /// Override the retry budget (CLI layer). The value is clamped.
    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.retry.max_retries = max_retries;
        self.clamp();
    }

    fn clamp(&mut self) {
        self.retry.max_retries = self.retry.max_retries.clamp(1, MAX_RETRIES_CEILING);
        self.session.max_id_len = self.session.max_id_len.clamp(16, 64);
        if self.agent.timeout_secs == 0 {
            self.agent.timeout_secs = AgentSettings::default().timeout_secs;
        }
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    pub fn escalations_dir(&self) -> PathBuf {
        self.state_dir.join("escalations")
    }

    pub fn promotions_dir(&self) -> PathBuf {
        self.state_dir.join("promotions")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir.join("archive")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.jobs_dir(),
            self.escalations_dir(),
            self.promotions_dir(),
            self.sessions_dir(),
            self.archive_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
