//! Single source of truth for job state.
//!
//! Every transition goes through [`JobStore::update`], which under one
//! write lock: applies the event to the cached state, persists the job
//! document for boundary events, appends the event to the job's log, and
//! only then broadcasts it. A status reader therefore never observes a
//! state older than an event that has already been streamed.

use anyhow::{Context, Result};
use futures::Stream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;

use super::job::{JobState, JobSummary};
use crate::errors::OrchestratorError;
use crate::sanitize::validate_identifier;
use crate::stream::JobEvent;
use crate::util::{append_jsonl, read_json, write_json_atomic};

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    state: JobState,
    tx: broadcast::Sender<JobEvent>,
}

pub struct JobStore {
    dir: PathBuf,
    jobs: RwLock<HashMap<String, Entry>>,
}

/// Events already emitted plus a live receiver for the rest.
pub struct JobSubscription {
    pub backlog: Vec<JobEvent>,
    pub receiver: Option<broadcast::Receiver<JobEvent>>,
}

impl JobSubscription {
    /// Backlog followed by live events, ending after `job_complete`.
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        let finished = self.backlog.iter().any(JobEvent::is_terminal);
        let receiver = if finished { None } else { self.receiver };
        let backlog = futures::stream::iter(self.backlog);
        let live = futures::stream::unfold(receiver, |receiver| async move {
            let mut rx = receiver?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let next = if event.is_terminal() { None } else { Some(rx) };
                        return Some((event, next));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Stream subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        futures::StreamExt::chain(backlog, live)
    }
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    fn state_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    pub fn event_log_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.events.jsonl", job_id))
    }

    pub fn job_path(&self, job_id: &str) -> PathBuf {
        self.state_path(job_id)
    }

    fn check_id(job_id: &str) -> Result<(), OrchestratorError> {
        validate_identifier("job id", job_id)?;
        Ok(())
    }

    /// Register a new job and persist its initial state.
    pub fn create(&self, state: JobState) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
        write_json_atomic(&self.state_path(&state.job_id), &state)?;
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        jobs.insert(state.job_id.clone(), Entry { state, tx });
        Ok(())
    }

    /// Load a persisted job into the cache if it is not already there.
    fn ensure_cached(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        Self::check_id(job_id)?;
        {
            let jobs = self
                .jobs
                .read()
                .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
            if jobs.contains_key(job_id) {
                return Ok(true);
            }
        }
        let Some(state) = read_json::<JobState>(&self.state_path(job_id))? else {
            return Ok(false);
        };
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
        jobs.entry(job_id.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            Entry { state, tx }
        });
        Ok(true)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobState>, OrchestratorError> {
        if !self.ensure_cached(job_id)? {
            return Ok(None);
        }
        let jobs = self
            .jobs
            .read()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
        Ok(jobs.get(job_id).map(|e| e.state.clone()))
    }

    /// Apply a transition and publish it. See the module docs for ordering.
    pub fn update<F>(
        &self,
        job_id: &str,
        event: Option<JobEvent>,
        mutate: F,
    ) -> Result<JobState, OrchestratorError>
    where
        F: FnOnce(&mut JobState),
    {
        if !self.ensure_cached(job_id)? {
            return Err(OrchestratorError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::JobNotFound {
                id: job_id.to_string(),
            })?;

        let mut next = entry.state.clone();
        if let Some(event) = &event {
            next.apply(event);
        }
        mutate(&mut next);

        let persist = event.as_ref().is_none_or(JobEvent::is_boundary);
        if persist {
            write_json_atomic(&self.state_path(job_id), &next)?;
        }
        if let Some(event) = &event {
            append_jsonl(&self.event_log_path(job_id), event)?;
        }
        entry.state = next.clone();
        if let Some(event) = event {
            // No subscribers is fine.
            let _ = entry.tx.send(event);
        }
        Ok(next)
    }

    /// Snapshot the event log and subscribe, atomically with respect to updates.
    pub fn subscribe(&self, job_id: &str) -> Result<Option<JobSubscription>, OrchestratorError> {
        if !self.ensure_cached(job_id)? {
            return Ok(None);
        }
        let jobs = self
            .jobs
            .read()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
        let Some(entry) = jobs.get(job_id) else {
            return Ok(None);
        };
        let backlog = read_events(&self.event_log_path(job_id))?;
        Ok(Some(JobSubscription {
            backlog,
            receiver: Some(entry.tx.subscribe()),
        }))
    }

    /// Summaries of every persisted job, newest first.
    pub fn list(&self) -> Result<Vec<JobSummary>> {
        let mut summaries = Vec::new();
        if self.dir.exists() {
            for entry in std::fs::read_dir(&self.dir)
                .with_context(|| format!("Failed to list {}", self.dir.display()))?
            {
                let path = entry?.path();
                let is_state = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".json") && !n.contains(".events."));
                if !is_state {
                    continue;
                }
                match read_json::<JobState>(&path) {
                    Ok(Some(state)) => summaries.push(state.summary()),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
                }
            }
        }

        let jobs = self
            .jobs
            .read()
            .map_err(|_| anyhow::anyhow!("job store lock poisoned"))?;
        for summary in summaries.iter_mut() {
            if let Some(entry) = jobs.get(&summary.job_id) {
                *summary = entry.state.summary();
            }
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }
}

fn read_events(path: &Path) -> Result<Vec<JobEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Corrupt job event log"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::PhaseStatus;
    use crate::orchestrator::job::JobStatus;
    use crate::project::{Project, ProjectManifest};
    use crate::stream::AgentEvent;
    use futures::StreamExt;
    use tempfile::tempdir;

    fn new_state(job_id: &str) -> JobState {
        let manifest: ProjectManifest =
            serde_yaml::from_str("name: demo\nphases:\n  - id: a\n    type: development\n")
                .unwrap();
        let project =
            Project::from_manifest("/p".into(), "/p/project.yaml".into(), manifest).unwrap();
        JobState::new(job_id, &project)
    }

    fn started() -> JobEvent {
        JobEvent::JobStarted {
            job_id: "job1".into(),
            project: "demo".into(),
            phases: vec!["a".into()],
        }
    }

    #[test]
    fn test_update_persists_before_returning() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.create(new_state("job1")).unwrap();
        store.update("job1", Some(started()), |_| {}).unwrap();

        let on_disk: JobState = read_json(&store.job_path("job1")).unwrap().unwrap();
        assert_eq!(on_disk.status, JobStatus::Running);
        assert_eq!(on_disk, store.get("job1").unwrap().unwrap());
    }

    #[test]
    fn test_output_lines_are_logged_but_not_persisted() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.create(new_state("job1")).unwrap();
        let line = JobEvent::OutputLine {
            phase_id: "a".into(),
            attempt: 1,
            event: AgentEvent::Text { text: "hi".into() },
        };
        store.update("job1", Some(line), |_| {}).unwrap();

        let on_disk: JobState = read_json(&store.job_path("job1")).unwrap().unwrap();
        assert_eq!(on_disk.event_count, 0);
        assert_eq!(store.get("job1").unwrap().unwrap().event_count, 1);
        assert_eq!(read_events(&store.event_log_path("job1")).unwrap().len(), 1);
    }

    #[test]
    fn test_get_reloads_from_disk() {
        let dir = tempdir().unwrap();
        {
            let store = JobStore::new(dir.path());
            store.create(new_state("job1")).unwrap();
        }
        let store = JobStore::new(dir.path());
        assert!(store.get("job1").unwrap().is_some());
        assert!(store.get("nope").unwrap().is_none());
        assert!(matches!(
            store.get("../etc"),
            Err(OrchestratorError::Security(_))
        ));
        assert!(matches!(
            store.update("nope", None, |_| {}),
            Err(OrchestratorError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscription_sees_backlog_then_live_events() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.create(new_state("job1")).unwrap();
        store.update("job1", Some(started()), |_| {}).unwrap();

        let sub = store.subscribe("job1").unwrap().unwrap();
        store
            .update(
                "job1",
                Some(JobEvent::PhaseStatus {
                    phase_id: "a".into(),
                    status: PhaseStatus::Completed,
                }),
                |_| {},
            )
            .unwrap();
        store
            .update(
                "job1",
                Some(JobEvent::JobComplete {
                    job_id: "job1".into(),
                    status: JobStatus::Completed,
                    failure: None,
                }),
                |_| {},
            )
            .unwrap();

        let events: Vec<JobEvent> = sub.into_stream().collect().await;
        assert_eq!(events.len(), 3);
        assert!(events[2].is_terminal());

        // A finished job replays its log and ends.
        let replay: Vec<JobEvent> = store
            .subscribe("job1")
            .unwrap()
            .unwrap()
            .into_stream()
            .collect()
            .await;
        assert_eq!(replay, events);
    }

    #[test]
    fn test_list_jobs() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.create(new_state("job1")).unwrap();
        store.create(new_state("job2")).unwrap();
        store.update("job1", Some(started()), |_| {}).unwrap();
        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 2);
        let job1 = jobs.iter().find(|j| j.job_id == "job1").unwrap();
        assert_eq!(job1.status, JobStatus::Running);
    }
}
