//! Typed error hierarchy for the evolve engine.
//!
//! Every subsystem error maps onto a [`FailureCategory`], which is what job
//! status exposes and what the retry controller uses to decide whether a
//! failure may consume retry budget:
//! - `SecurityViolation`: hostile identifiers or paths, never retried
//! - `ManifestError`: fatal configuration, rejected before any phase runs
//! - `AgentError`: transient agent failures (plus the distinct cancellation)
//! - `OrchestratorError`: job engine failures
//! - `PipelineError`: evolution pipeline stage failures
//! - `SessionError`: session store failures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy surfaced through job status and API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Spawn failure, timeout, missing runtime dependency. Retried within budget.
    Transient,
    /// A quality gate rejected the phase output. Retried with feedback.
    Verification,
    /// Hostile input. Rejected immediately, never retried.
    Security,
    /// Retry budget exhausted.
    Escalation,
    /// Malformed manifest, circular dependencies. Rejected before execution.
    FatalConfiguration,
    /// Cooperative cancellation. Terminal, never retried.
    Cancelled,
}

impl FailureCategory {
    /// Whether a failure of this category may be retried by the controller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Verification)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Verification => "verification",
            Self::Security => "security",
            Self::Escalation => "escalation",
            Self::FatalConfiguration => "fatal_configuration",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untrusted input that was rejected outright.
///
/// The offending input is rendered with `{:?}` so control characters are
/// escaped rather than echoed into logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityViolation {
    #[error("{kind} {input:?} contains a path traversal sequence")]
    PathTraversal { kind: &'static str, input: String },

    #[error("{kind} {input:?} contains a null byte")]
    NullByte { kind: &'static str, input: String },

    #[error("{kind} {input:?} contains shell metacharacters")]
    ShellMetacharacters { kind: &'static str, input: String },

    #[error("{kind} {input:?} must be a relative path")]
    AbsolutePath { kind: &'static str, input: String },

    #[error("{kind} {input:?} is not a valid identifier")]
    InvalidIdentifier { kind: &'static str, input: String },

    #[error("{kind} is empty after normalization")]
    EmptyIdentifier { kind: &'static str },
}

/// Errors raised while loading or validating a project manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("No project manifest found in {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read manifest at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Project declares no phases")]
    NoPhases,

    #[error("Phase {id} is declared more than once")]
    DuplicatePhase { id: String },

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Circular phase dependencies between: {}", .phases.join(", "))]
    DependencyCycle { phases: Vec<String> },

    #[error("File entry {path} is scoped to unknown phase {phase}")]
    UnknownPhaseScope { path: String, phase: String },

    #[error("Invalid quality gate on phase {phase}: {message}")]
    InvalidGate { phase: String, message: String },

    #[error(transparent)]
    Security(#[from] SecurityViolation),
}

impl ManifestError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Security(_) => FailureCategory::Security,
            _ => FailureCategory::FatalConfiguration,
        }
    }
}

/// Errors from a single agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write instruction document at {path}: {source}")]
    InstructionWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent run was cancelled")]
    Cancelled,

    #[error("Agent exited with non-zero code {exit_code:?}")]
    NonZeroExit { exit_code: Option<i32> },

    #[error("Agent exited (code {exit_code:?}) without writing the completion marker")]
    MissingCompletionMarker { exit_code: Option<i32> },

    #[error("Failed to read agent output: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Cancelled => FailureCategory::Cancelled,
            _ => FailureCategory::Transient,
        }
    }
}

/// Errors from the job engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Project {project} already has an active job {job_id}")]
    ProjectBusy { project: String, job_id: String },

    #[error("Cannot resume job {job_id}: {reason}")]
    InvalidResume { job_id: String, reason: String },

    #[error("Escalation for phase {phase_id} of job {job_id} is still open")]
    EscalationOpen { job_id: String, phase_id: String },

    #[error("No escalation recorded for phase {phase_id} of job {job_id}")]
    EscalationNotFound { job_id: String, phase_id: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Security(#[from] SecurityViolation),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::Manifest(e) => Some(e.category()),
            Self::Security(_) => Some(FailureCategory::Security),
            Self::EscalationOpen { .. } => Some(FailureCategory::Escalation),
            _ => None,
        }
    }
}

/// Errors from the evolution pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Project {name} not found")]
    ProjectNotFound { name: String },

    #[error("Environment {name} is not configured")]
    EnvironmentNotConfigured { name: String },

    #[error("Cannot {stage}: {reason}")]
    PreconditionFailed { stage: &'static str, reason: String },

    #[error("Another integration into production is in flight")]
    ProductionBusy,

    #[error("Production moved from baseline {expected} to {actual}; redeploy required")]
    StaleBaseline { expected: String, actual: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Security(#[from] SecurityViolation),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: String },

    #[error("Timed out after {waited_ms}ms waiting for the lock on session {id}")]
    LockTimeout { id: String, waited_ms: u128 },

    #[error(transparent)]
    Security(#[from] SecurityViolation),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_category_retryable_split() {
        assert!(FailureCategory::Transient.is_retryable());
        assert!(FailureCategory::Verification.is_retryable());
        assert!(!FailureCategory::Security.is_retryable());
        assert!(!FailureCategory::Escalation.is_retryable());
        assert!(!FailureCategory::FatalConfiguration.is_retryable());
        assert!(!FailureCategory::Cancelled.is_retryable());
    }

    #[test]
    fn failure_category_serializes_snake_case() {
        let json = serde_json::to_string(&FailureCategory::FatalConfiguration).unwrap();
        assert_eq!(json, "\"fatal_configuration\"");
        assert_eq!(FailureCategory::Security.to_string(), "security");
    }

    #[test]
    fn agent_cancel_is_not_a_transient_failure() {
        assert_eq!(AgentError::Cancelled.category(), FailureCategory::Cancelled);
        assert_eq!(
            AgentError::Timeout { secs: 5 }.category(),
            FailureCategory::Transient
        );
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "agent not found");
        let err = AgentError::SpawnFailed {
            program: "agent".into(),
            source: io_err,
        };
        assert_eq!(err.category(), FailureCategory::Transient);
    }

    #[test]
    fn manifest_security_errors_keep_security_category() {
        let violation = SecurityViolation::PathTraversal {
            kind: "manifest path",
            input: "../etc/passwd".into(),
        };
        let err: ManifestError = violation.into();
        assert_eq!(err.category(), FailureCategory::Security);
        assert_eq!(
            ManifestError::NoPhases.category(),
            FailureCategory::FatalConfiguration
        );
    }

    #[test]
    fn security_violation_escapes_control_characters() {
        let err = SecurityViolation::NullByte {
            kind: "correlation id",
            input: "abc\0def".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\\0"));
        assert!(!msg.contains('\0'));
    }

    #[test]
    fn cycle_error_lists_phases() {
        let err = ManifestError::DependencyCycle {
            phases: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ManifestError::NoPhases);
        assert_std_error(&AgentError::Cancelled);
        assert_std_error(&OrchestratorError::JobNotFound { id: "x".into() });
        assert_std_error(&PipelineError::ProductionBusy);
        assert_std_error(&SessionError::NotFound { id: "x".into() });
    }
}
