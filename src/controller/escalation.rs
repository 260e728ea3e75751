//! Escalation records and their durable store.
//!
//! An escalation is written when a phase exhausts its retry budget. It is
//! cleared only by an explicit `resolve`, never automatically. A phase that
//! escalates again after a resume gets a new record; resolved ones are kept.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::AttemptRecord;
use crate::util::{read_json, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Open,
    Resolved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        resolved_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub job_id: String,
    pub project: String,
    pub phase_id: String,
    /// 1 for the phase's first escalation in this job, then 2, 3, ...
    #[serde(default = "first_sequence")]
    pub sequence: u32,
    /// Every failed attempt across all runs of the phase, in order, with
    /// its gate result and derived feedback.
    pub attempts: Vec<AttemptRecord>,
    pub resolution: Resolution,
    pub created_at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(job_id: &str, project: &str, phase_id: &str, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            job_id: job_id.to_string(),
            project: project.to_string(),
            phase_id: phase_id.to_string(),
            sequence: first_sequence(),
            attempts,
            resolution: Resolution::Open,
            created_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.resolution, Resolution::Open)
    }
}

fn first_sequence() -> u32 {
    1
}

/// Stores escalations as `<dir>/<job_id>-<phase_id>-<sequence>.json`.
#[derive(Debug, Clone)]
pub struct EscalationStore {
    dir: PathBuf,
}

impl EscalationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, record: &EscalationRecord) -> PathBuf {
        self.dir.join(format!(
            "{}-{}-{}.json",
            record.job_id, record.phase_id, record.sequence
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, record: &EscalationRecord) -> Result<()> {
        write_json_atomic(&self.path(record), record)
    }

    /// Persist a new escalation, numbering it after any earlier ones for the
    /// same job and phase.
    pub fn create(&self, mut record: EscalationRecord) -> Result<EscalationRecord> {
        record.sequence = self
            .history(&record.job_id, &record.phase_id)?
            .last()
            .map_or(first_sequence(), |r| r.sequence + 1);
        self.save(&record)?;
        Ok(record)
    }

    /// Every escalation of one phase, oldest first.
    pub fn history(&self, job_id: &str, phase_id: &str) -> Result<Vec<EscalationRecord>> {
        let mut records: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| r.job_id == job_id && r.phase_id == phase_id)
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// The most recent escalation of a phase.
    pub fn load(&self, job_id: &str, phase_id: &str) -> Result<Option<EscalationRecord>> {
        Ok(self.history(job_id, phase_id)?.pop())
    }

    /// All escalations, oldest first.
    pub fn list(&self) -> Result<Vec<EscalationRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(record) = read_json::<EscalationRecord>(&path)?
            {
                records.push(record);
            }
        }
        records.sort_by_key(|r| (r.created_at, r.sequence));
        Ok(records)
    }

    /// Mark the latest escalation of a phase resolved. Returns `None` when no
    /// such escalation exists.
    pub fn resolve(
        &self,
        job_id: &str,
        phase_id: &str,
        note: Option<String>,
    ) -> Result<Option<EscalationRecord>> {
        let Some(mut record) = self.load(job_id, phase_id)? else {
            return Ok(None);
        };
        if record.is_open() {
            record.resolution = Resolution::Resolved {
                note,
                resolved_at: Utc::now(),
            };
            self.save(&record)?;
            tracing::info!(job_id = %job_id, phase = %phase_id, "Escalation resolved");
        }
        Ok(Some(record))
    }
}
