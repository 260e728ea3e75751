//! Job engine: runs a project's phases in order, one job per project at a time.

use anyhow::Context;
use fs2::FileExt;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::job::{FailureReport, JobState, JobStatus, JobSummary};
use super::store::JobStore;
use crate::config::Config;
use crate::controller::{
    AttemptRecord, EscalationRecord, EscalationStore, PhaseObserver, PhaseOutcome, PhaseRun,
    PhaseStatus, RetryController,
};
use crate::errors::{FailureCategory, OrchestratorError};
use crate::project::{Project, ProjectState, ProjectStatus};
use crate::runner::{AgentRunner, CancelToken, ProcessAgentRunner};
use crate::sanitize::{reject_null_bytes, validate_identifier};
use crate::stream::{AgentEvent, JobEvent};
use crate::verify::Verifier;

/// A project claimed by a job in this process.
///
/// The advisory lock on `<project>/.evolve/job.lock` keeps other processes
/// off the project; dropping the claim releases it.
struct ProjectClaim {
    job_id: String,
    _lock: File,
}

struct Inner {
    config: Config,
    store: JobStore,
    controller: RetryController,
    /// Canonical project root -> the job executing it.
    active: Mutex<HashMap<PathBuf, ProjectClaim>>,
    cancels: Mutex<HashMap<String, CancelToken>>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<PathBuf, ProjectClaim>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        self.cancels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, job_id: &str, event: JobEvent) {
        if let Err(e) = self.store.update(job_id, Some(event), |_| {}) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job event");
        }
    }
}

/// Feeds controller progress into the job store.
struct JobObserver {
    inner: Arc<Inner>,
    job_id: String,
    index: usize,
}

impl PhaseObserver for JobObserver {
    fn status(&self, phase_id: &str, status: PhaseStatus) {
        self.inner.emit(
            &self.job_id,
            JobEvent::PhaseStatus {
                phase_id: phase_id.to_string(),
                status,
            },
        );
    }

    fn attempt_started(&self, phase_id: &str, attempt: u32) {
        self.inner.emit(
            &self.job_id,
            JobEvent::PhaseStart {
                phase_id: phase_id.to_string(),
                index: self.index,
                attempt,
            },
        );
    }

    fn agent_event(&self, phase_id: &str, attempt: u32, event: AgentEvent) {
        self.inner.emit(
            &self.job_id,
            JobEvent::OutputLine {
                phase_id: phase_id.to_string(),
                attempt,
                event,
            },
        );
    }

    fn attempt_finished(&self, phase_id: &str, record: &AttemptRecord) {
        let event = match record.category {
            Some(category) if category != FailureCategory::Cancelled => {
                Some(JobEvent::AttemptFailed {
                    phase_id: phase_id.to_string(),
                    attempt: record.attempt,
                    category,
                    summary: record
                        .error
                        .clone()
                        .or_else(|| record.gate_result.as_ref().map(|g| g.summary()))
                        .unwrap_or_else(|| category.to_string()),
                })
            }
            _ => None,
        };
        let result = self
            .inner
            .store
            .update(&self.job_id, event, |state| state.record_attempt(phase_id, record));
        if let Err(e) = result {
            tracing::error!(job_id = %self.job_id, phase = %phase_id, error = %e, "Failed to record attempt");
        }
    }
}

/// Handle to the job engine. Cheap to clone.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<Inner>,
}

impl JobEngine {
    pub fn new(config: Config, runner: Arc<dyn AgentRunner>) -> Self {
        let controller = RetryController::new(
            runner,
            Verifier::new(config.verification.clone()),
            EscalationStore::new(config.escalations_dir()),
            config.agent.completion_marker.clone(),
            config.phase_timeout(),
        );
        Self {
            inner: Arc::new(Inner {
                store: JobStore::new(config.jobs_dir()),
                controller,
                config,
                active: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Engine driving the configured agent command.
    pub fn from_config(config: Config) -> Self {
        let runner = Arc::new(ProcessAgentRunner::from_settings(&config.agent));
        Self::new(config, runner)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Load the project at `path` and start executing it. Returns the job id.
    pub async fn start(&self, path: &Path) -> Result<String, OrchestratorError> {
        reject_null_bytes("project path", &path.to_string_lossy())?;
        let project = Project::load(path)?;
        let root = canonical_root(&project)?;
        let job_id = uuid::Uuid::new_v4().to_string();

        self.claim(&root, &project.name, &job_id)?;
        if let Err(e) = self.inner.store.create(JobState::new(&job_id, &project)) {
            self.release(&root, &job_id);
            return Err(e.into());
        }
        tracing::info!(job_id = %job_id, project = %project.name, phases = project.phases.len(), "Job created");
        self.spawn(project, root, job_id.clone());
        Ok(job_id)
    }

    /// Resume a finished job, skipping phases that already completed.
    ///
    /// `from_phase` may only name the first incomplete phase, or an earlier
    /// completed one when `reset` is set; the latter resets it and every
    /// following phase to pending.
    pub async fn resume(
        &self,
        job_id: &str,
        from_phase: Option<&str>,
        reset: bool,
    ) -> Result<JobState, OrchestratorError> {
        let state = self.status(job_id)?;
        let invalid = |reason: String| OrchestratorError::InvalidResume {
            job_id: job_id.to_string(),
            reason,
        };

        if self.inner.cancels().contains_key(job_id) {
            return Err(invalid("job is still running".into()));
        }

        if state.status == JobStatus::Escalated
            && let Some(phase) = state
                .phases
                .iter()
                .find(|p| p.status == PhaseStatus::Escalated)
        {
            let record = self
                .inner
                .controller
                .escalations()
                .load(job_id, &phase.id)?
                .ok_or_else(|| OrchestratorError::EscalationNotFound {
                    job_id: job_id.to_string(),
                    phase_id: phase.id.clone(),
                })?;
            if record.is_open() {
                return Err(OrchestratorError::EscalationOpen {
                    job_id: job_id.to_string(),
                    phase_id: phase.id.clone(),
                });
            }
        }

        let project = Project::load(&state.project_root)?;
        let declared: Vec<&str> = project.phases.iter().map(|p| p.id.as_str()).collect();
        let recorded: Vec<&str> = state.phases.iter().map(|p| p.id.as_str()).collect();
        if declared != recorded {
            return Err(invalid("project phases changed since the job started".into()));
        }

        let first = state.first_incomplete().unwrap_or(state.phases.len());
        let start = match from_phase {
            Some(id) => {
                validate_identifier("phase id", id)?;
                state
                    .phase_index(id)
                    .ok_or_else(|| invalid(format!("unknown phase {}", id)))?
            }
            None => first,
        };
        if start > first {
            return Err(invalid(format!(
                "phase {} would skip incomplete phase {}",
                state.phases[start].id, state.phases[first].id
            )));
        }
        if start == state.phases.len() {
            return Err(invalid("every phase has already completed".into()));
        }
        if start < first && !reset {
            return Err(invalid(format!(
                "phase {} already completed; pass reset to run it again",
                state.phases[start].id
            )));
        }

        let root = canonical_root(&project)?;
        self.claim(&root, &project.name, job_id)?;
        let updated = self.inner.store.update(job_id, None, |s| {
            if reset {
                s.reset_from(start);
            }
            s.status = JobStatus::Queued;
            s.ended_at = None;
        });
        let updated = match updated {
            Ok(state) => state,
            Err(e) => {
                self.release(&root, job_id);
                return Err(e);
            }
        };
        tracing::info!(job_id = %job_id, from = %updated.phases[start].id, reset, "Job resumed");
        self.spawn(project, root, job_id.to_string());
        Ok(updated)
    }

    pub fn status(&self, job_id: &str) -> Result<JobState, OrchestratorError> {
        self.inner
            .store
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    pub fn list(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        Ok(self.inner.store.list()?)
    }

    /// Request cancellation. Cancelling a finished job is a no-op.
    pub fn cancel(&self, job_id: &str) -> Result<JobState, OrchestratorError> {
        let state = self.status(job_id)?;
        if state.status.is_terminal() {
            return Ok(state);
        }
        let token = self.inner.cancels().get(job_id).cloned();
        match token {
            Some(token) => {
                tracing::info!(job_id = %job_id, "Cancellation requested");
                token.cancel();
                Ok(state)
            }
            None => {
                // Left running by a previous process; nothing is executing it.
                tracing::warn!(job_id = %job_id, "Cancelling orphaned job");
                self.inner.store.update(
                    job_id,
                    Some(JobEvent::JobComplete {
                        job_id: job_id.to_string(),
                        status: JobStatus::Cancelled,
                        failure: None,
                    }),
                    |_| {},
                )
            }
        }
    }

    /// Events emitted so far followed by live ones, ending with `job_complete`.
    pub fn stream(
        &self,
        job_id: &str,
    ) -> Result<impl Stream<Item = JobEvent> + Send + 'static, OrchestratorError> {
        let subscription =
            self.inner
                .store
                .subscribe(job_id)?
                .ok_or_else(|| OrchestratorError::JobNotFound {
                    id: job_id.to_string(),
                })?;
        Ok(subscription.into_stream())
    }

    /// Block until the job reaches a terminal status.
    pub async fn wait_for_completion(&self, job_id: &str) -> Result<JobState, OrchestratorError> {
        let running = self.inner.cancels().contains_key(job_id);
        let state = self.status(job_id)?;
        if state.status.is_terminal() || !running {
            return Ok(state);
        }
        let mut events = Box::pin(self.stream(job_id)?);
        while events.next().await.is_some() {}
        self.status(job_id)
    }

    pub fn escalations(&self) -> Result<Vec<EscalationRecord>, OrchestratorError> {
        Ok(self.inner.controller.escalations().list()?)
    }

    pub fn resolve_escalation(
        &self,
        job_id: &str,
        phase_id: &str,
        note: Option<String>,
    ) -> Result<EscalationRecord, OrchestratorError> {
        validate_identifier("job id", job_id)?;
        validate_identifier("phase id", phase_id)?;
        self.inner
            .controller
            .escalations()
            .resolve(job_id, phase_id, note)?
            .ok_or_else(|| OrchestratorError::EscalationNotFound {
                job_id: job_id.to_string(),
                phase_id: phase_id.to_string(),
            })
    }

    fn claim(&self, root: &Path, project: &str, job_id: &str) -> Result<(), OrchestratorError> {
        let mut active = self.inner.active();
        if let Some(existing) = active.get(root) {
            tracing::warn!(project = %project, job_id = %existing.job_id, "Rejected job for busy project");
            return Err(OrchestratorError::ProjectBusy {
                project: project.to_string(),
                job_id: existing.job_id.clone(),
            });
        }

        let lock = open_job_lock(root)?;
        match FileExt::try_lock_exclusive(&lock) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = ProjectState::load(root)
                    .ok()
                    .and_then(|s| s.last_job_id)
                    .unwrap_or_else(|| "in another process".to_string());
                tracing::warn!(project = %project, job_id = %holder, "Project locked by another process");
                return Err(OrchestratorError::ProjectBusy {
                    project: project.to_string(),
                    job_id: holder,
                });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to lock project {}", project))
                    .into());
            }
        }

        active.insert(
            root.to_path_buf(),
            ProjectClaim {
                job_id: job_id.to_string(),
                _lock: lock,
            },
        );
        self.inner
            .cancels()
            .insert(job_id.to_string(), CancelToken::new());
        Ok(())
    }

    fn release(&self, root: &Path, job_id: &str) {
        self.inner.active().remove(root);
        self.inner.cancels().remove(job_id);
    }

    fn spawn(&self, project: Project, root: PathBuf, job_id: String) {
        if let Err(e) = ProjectState::set(&project.root, ProjectStatus::Running, Some(&job_id)) {
            tracing::warn!(project = %project.name, error = %e, "Failed to update project state");
        }
        let cancel = self
            .inner
            .cancels()
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_job(project, root, job_id, cancel).await;
        });
    }

    async fn run_job(&self, project: Project, root: PathBuf, job_id: String, cancel: CancelToken) {
        let inner = &self.inner;
        inner.emit(
            &job_id,
            JobEvent::JobStarted {
                job_id: job_id.clone(),
                project: project.name.clone(),
                phases: project.phases.iter().map(|p| p.id.clone()).collect(),
            },
        );

        let mut status = JobStatus::Completed;
        let mut failure = None;
        for (index, phase) in project.phases.iter().enumerate() {
            let prior = match inner.store.get(&job_id) {
                Ok(Some(state)) => state.phases.get(index).cloned(),
                Ok(None) => None,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to read job state");
                    None
                }
            };
            if prior
                .as_ref()
                .is_some_and(|p| p.status == PhaseStatus::Completed)
            {
                tracing::debug!(job_id = %job_id, phase = %phase.id, "Skipping completed phase");
                continue;
            }

            let observer = Arc::new(JobObserver {
                inner: Arc::clone(inner),
                job_id: job_id.clone(),
                index,
            });
            let prior_attempts = prior.map(|p| p.attempts).unwrap_or_default();
            let result = inner
                .controller
                .run_with_verification(PhaseRun {
                    job_id: &job_id,
                    project: &project,
                    phase,
                    max_retries: inner.config.retry.max_retries,
                    prior_attempts: &prior_attempts,
                    cancel: &cancel,
                    observer,
                })
                .await;

            inner.emit(
                &job_id,
                JobEvent::PhaseComplete {
                    phase_id: phase.id.clone(),
                    status: result.status(),
                    attempts: result.attempts.len() as u32,
                },
            );

            match result.outcome {
                PhaseOutcome::Completed => continue,
                PhaseOutcome::Escalated(record) => {
                    inner.emit(
                        &job_id,
                        JobEvent::Escalated {
                            phase_id: phase.id.clone(),
                            attempts: record.attempts.len() as u32,
                        },
                    );
                    status = JobStatus::Escalated;
                    failure = Some(FailureReport {
                        category: FailureCategory::Escalation,
                        message: format!(
                            "phase {} failed verification {} times",
                            phase.id,
                            record.attempts.len()
                        ),
                        phase_id: Some(phase.id.clone()),
                    });
                }
                PhaseOutcome::Cancelled => {
                    status = JobStatus::Cancelled;
                    failure = Some(FailureReport {
                        category: FailureCategory::Cancelled,
                        message: "job cancelled".to_string(),
                        phase_id: Some(phase.id.clone()),
                    });
                }
                PhaseOutcome::Aborted { category, message } => {
                    status = JobStatus::Failed;
                    failure = Some(FailureReport {
                        category,
                        message,
                        phase_id: Some(phase.id.clone()),
                    });
                }
            }
            break;
        }

        let project_status = match status {
            JobStatus::Completed => ProjectStatus::Ready,
            JobStatus::Escalated => ProjectStatus::Escalated,
            JobStatus::Cancelled => ProjectStatus::Cancelled,
            _ => ProjectStatus::Failed,
        };
        if let Err(e) = ProjectState::set(&project.root, project_status, Some(&job_id)) {
            tracing::warn!(project = %project.name, error = %e, "Failed to update project state");
        }

        // The project frees up before job_complete is observable; the job
        // counts as running until the event is out.
        inner.active().remove(&root);
        inner.emit(
            &job_id,
            JobEvent::JobComplete {
                job_id: job_id.clone(),
                status,
                failure,
            },
        );
        inner.cancels().remove(&job_id);
        tracing::info!(job_id = %job_id, project = %project.name, status = ?status, "Job finished");
    }
}

fn open_job_lock(root: &Path) -> Result<File, OrchestratorError> {
    let dir = root.join(".evolve");
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join("job.lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(file)
}

fn canonical_root(project: &Project) -> Result<PathBuf, OrchestratorError> {
    let root = project
        .root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", project.root.display()))?;
    Ok(root)
}
