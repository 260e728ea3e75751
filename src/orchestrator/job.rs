//! Job and per-phase state.
//!
//! `JobState` is mutated only by applying `JobEvent`s (plus attempt
//! records) inside the job store, so the persisted document and the live
//! stream are derived from the same transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::controller::{AttemptRecord, PhaseStatus};
use crate::errors::FailureCategory;
use crate::project::{PhaseType, Project};
use crate::stream::JobEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Escalated,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Escalated | Self::Cancelled | Self::Failed
        )
    }
}

/// Category and message of the most recent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub category: FailureCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub phase_type: PhaseType,
    pub status: PhaseStatus,
    /// Full attempt history across runs of this phase.
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub agent_ms: u64,
    pub cost_usd: f64,
    pub attempts: u32,
    pub output_lines: u64,
}

impl ResourceUsage {
    pub fn record(&mut self, attempt: &AttemptRecord) {
        self.agent_ms += attempt.agent_ms;
        self.cost_usd += attempt.cost_usd.unwrap_or(0.0);
        self.attempts += 1;
        self.output_lines += attempt.output_lines;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub project: String,
    pub project_root: PathBuf,
    pub status: JobStatus,
    /// Index into `phases` of the phase currently (or last) executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<usize>,
    pub phases: Vec<PhaseRecord>,
    pub event_count: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub usage: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReport>,
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub project: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new(job_id: &str, project: &Project) -> Self {
        Self {
            job_id: job_id.to_string(),
            project: project.name.clone(),
            project_root: project.root.clone(),
            status: JobStatus::Queued,
            current_phase: None,
            phases: project
                .phases
                .iter()
                .map(|p| PhaseRecord {
                    id: p.id.clone(),
                    phase_type: p.phase_type,
                    status: PhaseStatus::Pending,
                    attempts: Vec::new(),
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            event_count: 0,
            started_at: Utc::now(),
            ended_at: None,
            usage: ResourceUsage::default(),
            last_failure: None,
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Index of the first phase that has not completed.
    pub fn first_incomplete(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.status != PhaseStatus::Completed)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            project: self.project.clone(),
            status: self.status,
            current_phase: self
                .current_phase
                .and_then(|i| self.phases.get(i))
                .map(|p| p.id.clone()),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Append an attempt to its phase history and the usage counters.
    pub fn record_attempt(&mut self, phase_id: &str, attempt: &AttemptRecord) {
        self.usage.record(attempt);
        if let Some(phase) = self.phase_mut(phase_id) {
            phase.attempts.push(attempt.clone());
        }
        if let Some(category) = attempt.category {
            self.last_failure = Some(FailureReport {
                category,
                message: attempt
                    .error
                    .clone()
                    .or_else(|| attempt.gate_result.as_ref().map(|g| g.summary()))
                    .unwrap_or_else(|| category.to_string()),
                phase_id: Some(phase_id.to_string()),
            });
        }
    }

    /// Apply the state transition carried by `event`.
    pub fn apply(&mut self, event: &JobEvent) {
        self.event_count += 1;
        match event {
            JobEvent::JobStarted { .. } => {
                self.status = JobStatus::Running;
                self.ended_at = None;
            }
            JobEvent::PhaseStart {
                phase_id, index, ..
            } => {
                self.current_phase = Some(*index);
                if let Some(phase) = self.phase_mut(phase_id) {
                    phase.status = PhaseStatus::Running;
                    phase.started_at.get_or_insert_with(Utc::now);
                    phase.finished_at = None;
                }
            }
            JobEvent::PhaseStatus { phase_id, status } => {
                if let Some(phase) = self.phase_mut(phase_id) {
                    phase.status = *status;
                    if status.is_terminal() {
                        phase.finished_at = Some(Utc::now());
                    }
                }
            }
            JobEvent::OutputLine { .. } | JobEvent::AttemptFailed { .. } => {}
            JobEvent::PhaseComplete {
                phase_id, status, ..
            } => {
                if let Some(phase) = self.phase_mut(phase_id) {
                    phase.status = *status;
                    phase.finished_at = Some(Utc::now());
                }
            }
            JobEvent::Escalated { phase_id, .. } => {
                if let Some(phase) = self.phase_mut(phase_id) {
                    phase.status = PhaseStatus::Escalated;
                }
            }
            JobEvent::JobComplete {
                status, failure, ..
            } => {
                self.status = *status;
                self.ended_at = Some(Utc::now());
                if let Some(failure) = failure {
                    self.last_failure = Some(failure.clone());
                }
            }
        }
    }

    /// Reset `phases[from..]` to pending. The only permitted regression.
    pub fn reset_from(&mut self, from: usize) {
        for phase in self.phases.iter_mut().skip(from) {
            phase.status = PhaseStatus::Pending;
            phase.started_at = None;
            phase.finished_at = None;
        }
    }
}
