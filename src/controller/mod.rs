//! Retry/Escalation Controller.
//!
//! Runs one phase as a bounded state machine:
//!
//! ```text
//! PENDING -> RUNNING -> VERIFYING -> COMPLETED
//!                 ^          |
//!                 |          v (failed, attempts < max_retries)
//!                 +------ RETRYING
//!                            | (attempts == max_retries)
//!                            v
//!                        ESCALATED
//! ```
//!
//! The budget is checked before every attempt, so a phase with
//! `max_retries = N` records at most N attempts. Verification failures and
//! transient agent errors consume budget; cancellation and security
//! violations end the phase without touching it.

pub mod escalation;
pub mod feedback;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{AgentError, FailureCategory};
use crate::project::{PhaseSpec, Project};
use crate::runner::{AgentInvocation, AgentRunner, CancelToken, EventSink};
use crate::sanitize::validate_identifier;
use crate::stream::AgentEvent;
use crate::util::write_private;
use crate::verify::{QualityGateResult, Verifier};

pub use escalation::{EscalationRecord, EscalationStore, Resolution};
use feedback::{InstructionContext, render_feedback, render_instructions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Verifying,
    Retrying,
    Completed,
    Escalated,
    Cancelled,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Escalated | Self::Cancelled | Self::Failed
        )
    }
}

/// History entry for one attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the attempt passed verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<QualityGateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub agent_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub output_lines: u64,
}

impl AttemptRecord {
    fn started(attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            attempt,
            started_at: now,
            finished_at: now,
            category: None,
            gate_result: None,
            feedback: None,
            error: None,
            agent_ms: 0,
            cost_usd: None,
            output_lines: 0,
        }
    }

    fn failed(mut self, category: FailureCategory, error: Option<String>) -> Self {
        self.category = Some(category);
        self.error = error;
        self.finished_at = Utc::now();
        self
    }

    pub fn passed(&self) -> bool {
        self.category.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed,
    Escalated(EscalationRecord),
    Cancelled,
    /// Non-retryable failure; no further attempts were made.
    Aborted {
        category: FailureCategory,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub outcome: PhaseOutcome,
    /// Attempts made during this run, in order.
    pub attempts: Vec<AttemptRecord>,
}

impl PhaseResult {
    pub fn status(&self) -> PhaseStatus {
        match self.outcome {
            PhaseOutcome::Completed => PhaseStatus::Completed,
            PhaseOutcome::Escalated(_) => PhaseStatus::Escalated,
            PhaseOutcome::Cancelled => PhaseStatus::Cancelled,
            PhaseOutcome::Aborted { .. } => PhaseStatus::Failed,
        }
    }
}

/// Receives progress from a running phase.
///
/// The job engine implements this to persist status and feed the live
/// stream; every call must be applied before the controller proceeds.
pub trait PhaseObserver: Send + Sync {
    fn status(&self, phase_id: &str, status: PhaseStatus);
    fn attempt_started(&self, phase_id: &str, attempt: u32);
    fn agent_event(&self, phase_id: &str, attempt: u32, event: AgentEvent);
    fn attempt_finished(&self, phase_id: &str, record: &AttemptRecord);
}

/// Parameters of one phase run.
pub struct PhaseRun<'a> {
    pub job_id: &'a str,
    pub project: &'a Project,
    pub phase: &'a PhaseSpec,
    pub max_retries: u32,
    /// Attempts recorded by earlier runs of this phase; numbering continues after them.
    pub prior_attempts: &'a [AttemptRecord],
    pub cancel: &'a CancelToken,
    pub observer: Arc<dyn PhaseObserver>,
}

pub struct RetryController {
    runner: Arc<dyn AgentRunner>,
    verifier: Verifier,
    escalations: EscalationStore,
    marker: String,
    timeout: Duration,
}

impl RetryController {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        verifier: Verifier,
        escalations: EscalationStore,
        marker: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            verifier,
            escalations,
            marker: marker.into(),
            timeout,
        }
    }

    pub fn escalations(&self) -> &EscalationStore {
        &self.escalations
    }

    /// Drive one phase to a terminal outcome.
    pub async fn run_with_verification(&self, run: PhaseRun<'_>) -> PhaseResult {
        let PhaseRun {
            job_id,
            project,
            phase,
            max_retries,
            prior_attempts,
            cancel,
            observer,
        } = run;
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        let abort = |attempts: Vec<AttemptRecord>, category: FailureCategory, message: String| {
            tracing::error!(phase = %phase.id, category = %category, error = %message, "Phase aborted");
            observer.status(&phase.id, PhaseStatus::Failed);
            PhaseResult {
                outcome: PhaseOutcome::Aborted { category, message },
                attempts,
            }
        };

        if let Err(violation) = validate_identifier("phase id", &phase.id) {
            return abort(attempts, FailureCategory::Security, violation.to_string());
        }

        let layout = project.layout(&phase.id);
        if let Err(e) = layout.ensure() {
            return abort(attempts, FailureCategory::Transient, format!("{:#}", e));
        }
        let body = match project.instruction_text(phase) {
            Ok(body) => body,
            Err(e) => {
                return abort(
                    attempts,
                    FailureCategory::FatalConfiguration,
                    format!("{:#}", e),
                );
            }
        };
        let marker_path = layout.marker_path(&self.marker);
        let mut feedback: Option<(PathBuf, String)> = None;

        loop {
            if cancel.is_cancelled() {
                observer.status(&phase.id, PhaseStatus::Cancelled);
                return PhaseResult {
                    outcome: PhaseOutcome::Cancelled,
                    attempts,
                };
            }

            if attempts.len() as u32 >= max_retries {
                let history = prior_attempts
                    .iter()
                    .filter(|a| !a.passed())
                    .chain(attempts.iter())
                    .cloned()
                    .collect();
                let record = EscalationRecord::new(job_id, &project.name, &phase.id, history);
                // An escalation nobody can find could never be resolved.
                let record = match self.escalations.create(record) {
                    Ok(record) => record,
                    Err(e) => {
                        return abort(
                            attempts,
                            FailureCategory::Transient,
                            format!("failed to persist escalation: {:#}", e),
                        );
                    }
                };
                tracing::warn!(
                    job_id = %job_id,
                    phase = %phase.id,
                    attempts = attempts.len(),
                    "Retry budget exhausted; phase escalated"
                );
                observer.status(&phase.id, PhaseStatus::Escalated);
                return PhaseResult {
                    outcome: PhaseOutcome::Escalated(record),
                    attempts,
                };
            }

            let attempt = (prior_attempts.len() + attempts.len()) as u32 + 1;
            if !attempts.is_empty() {
                observer.status(&phase.id, PhaseStatus::Retrying);
            }
            observer.status(&phase.id, PhaseStatus::Running);
            observer.attempt_started(&phase.id, attempt);
            let record = AttemptRecord::started(attempt);

            let instructions = render_instructions(&InstructionContext {
                project,
                phase,
                attempt,
                body: body.as_deref(),
                marker_path: &marker_path,
                feedback: feedback.as_ref().map(|(p, f)| (p.as_path(), f.as_str())),
            });
            let instructions_path = layout.instructions_path(attempt);
            if let Err(source) = write_private(&instructions_path, &instructions) {
                let err = AgentError::InstructionWriteFailed {
                    path: instructions_path,
                    source,
                };
                let record = record.failed(err.category(), Some(err.to_string()));
                observer.attempt_finished(&phase.id, &record);
                attempts.push(record);
                continue;
            }

            let invocation = AgentInvocation {
                phase_id: phase.id.clone(),
                attempt,
                instructions_path,
                working_dir: layout.output_dir(),
                marker_path: marker_path.clone(),
                timeout: self.timeout,
            };
            let sink: EventSink = {
                let observer = observer.clone();
                let phase_id = phase.id.clone();
                Arc::new(move |event| observer.agent_event(&phase_id, attempt, event))
            };

            let mut record = record;
            match self.runner.execute(&invocation, sink, cancel).await {
                Err(AgentError::Cancelled) => {
                    let record = record.failed(
                        FailureCategory::Cancelled,
                        Some(AgentError::Cancelled.to_string()),
                    );
                    observer.attempt_finished(&phase.id, &record);
                    attempts.push(record);
                    observer.status(&phase.id, PhaseStatus::Cancelled);
                    return PhaseResult {
                        outcome: PhaseOutcome::Cancelled,
                        attempts,
                    };
                }
                Err(e) => {
                    tracing::warn!(phase = %phase.id, attempt, error = %e, "Agent attempt failed");
                    let record = record.failed(e.category(), Some(e.to_string()));
                    observer.attempt_finished(&phase.id, &record);
                    attempts.push(record);
                }
                Ok(agent_run) => {
                    record.agent_ms = agent_run.duration.as_millis() as u64;
                    record.cost_usd = agent_run.cost_usd;
                    record.output_lines = agent_run.output_lines;

                    observer.status(&phase.id, PhaseStatus::Verifying);
                    let gate = self
                        .verifier
                        .verify(project, phase, &layout.output_dir())
                        .await;

                    if gate.passed {
                        record.gate_result = Some(gate);
                        record.finished_at = Utc::now();
                        observer.attempt_finished(&phase.id, &record);
                        attempts.push(record);
                        observer.status(&phase.id, PhaseStatus::Completed);
                        tracing::info!(phase = %phase.id, attempt, "Phase completed");
                        return PhaseResult {
                            outcome: PhaseOutcome::Completed,
                            attempts,
                        };
                    }

                    let text = render_feedback(&phase.id, attempt, &gate);
                    let feedback_path = layout.feedback_path(attempt);
                    if let Err(e) = write_private(&feedback_path, &text) {
                        tracing::warn!(phase = %phase.id, error = %e, "Failed to write feedback file");
                    }
                    tracing::info!(phase = %phase.id, attempt, summary = %gate.summary(), "Verification failed");

                    let mut record = record.failed(FailureCategory::Verification, None);
                    record.gate_result = Some(gate);
                    record.feedback = Some(text.clone());
                    observer.attempt_finished(&phase.id, &record);
                    attempts.push(record);
                    feedback = Some((feedback_path, text));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process agents and observers for controller and engine tests.

    use super::*;
    use crate::runner::AgentRun;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// What a scripted agent does on one attempt.
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Write these `(relative path, content)` files and the marker.
        Write(Vec<(&'static str, &'static str)>),
        /// Fail to spawn.
        SpawnError,
        /// Block until cancelled.
        Hang,
    }

    /// Plays back one step per attempt; the last step repeats.
    pub struct ScriptedAgent {
        steps: Vec<Step>,
        pub calls: Mutex<Vec<AgentInvocation>>,
    }

    impl ScriptedAgent {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        async fn execute(
            &self,
            invocation: &AgentInvocation,
            sink: EventSink,
            cancel: &CancelToken,
        ) -> Result<AgentRun, AgentError> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(invocation.clone());
                calls.len() - 1
            };
            let step = self.steps[index.min(self.steps.len() - 1)].clone();
            match step {
                Step::SpawnError => Err(AgentError::SpawnFailed {
                    program: "scripted".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                }),
                Step::Hang => {
                    cancel.cancelled().await;
                    Err(AgentError::Cancelled)
                }
                Step::Write(files) => {
                    for (rel, content) in files {
                        let path = invocation.working_dir.join(rel);
                        std::fs::create_dir_all(path.parent().unwrap())?;
                        std::fs::write(path, content)?;
                    }
                    sink(AgentEvent::Text {
                        text: format!("attempt {}", invocation.attempt),
                    });
                    std::fs::write(&invocation.marker_path, "")?;
                    Ok(AgentRun {
                        exit_code: Some(0),
                        duration: Duration::from_millis(5),
                        cost_usd: Some(0.01),
                        output_lines: 1,
                    })
                }
            }
        }
    }

    /// Records every observer call.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub statuses: Mutex<Vec<(String, PhaseStatus)>>,
        pub events: Mutex<Vec<AgentEvent>>,
        pub finished: Mutex<Vec<AttemptRecord>>,
    }

    impl PhaseObserver for RecordingObserver {
        fn status(&self, phase_id: &str, status: PhaseStatus) {
            self.statuses
                .lock()
                .unwrap()
                .push((phase_id.to_string(), status));
        }
        fn attempt_started(&self, _phase_id: &str, _attempt: u32) {}
        fn agent_event(&self, _phase_id: &str, _attempt: u32, event: AgentEvent) {
            self.events.lock().unwrap().push(event);
        }
        fn attempt_finished(&self, _phase_id: &str, record: &AttemptRecord) {
            self.finished.lock().unwrap().push(record.clone());
        }
    }
}
