//! Promotion records and their store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::util::{append_jsonl, read_json, write_json_atomic};
use crate::verify::QualityGateResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStage {
    Developing,
    Ready,
    Deployed,
    Validated,
    Integrated,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Deploy,
    Validate,
    Integrate,
    Rollback,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Validate => "validate",
            Self::Integrate => "integrate",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageName,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub at: DateTime<Utc>,
}

/// One run of the evolution pipeline for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub id: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub test_env: PathBuf,
    pub production_env: PathBuf,
    pub stage: PromotionStage,
    /// Production revision the test environment was synchronised to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
    /// Test environment revision holding the deployed artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrated_revision: Option<String>,
    /// Environment name -> revision to restore on rollback.
    #[serde(default)]
    pub last_known_good: BTreeMap<String, String>,
    /// Environments changed by this run and not yet rolled back.
    #[serde(default)]
    pub mutated: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<QualityGateResult>,
    #[serde(default)]
    pub outcomes: Vec<StageOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromotionRecord {
    pub fn new(
        project: &str,
        job_id: Option<String>,
        test_env: PathBuf,
        production_env: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project: project.to_string(),
            job_id,
            test_env,
            production_env,
            stage: PromotionStage::Ready,
            baseline: None,
            deployed_revision: None,
            integrated_revision: None,
            last_known_good: BTreeMap::new(),
            mutated: Vec::new(),
            artifacts: Vec::new(),
            validation: None,
            outcomes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a stage outcome and move to `stage`.
    pub fn record(
        &mut self,
        name: StageName,
        stage: PromotionStage,
        passed: bool,
        message: impl Into<String>,
        revision: Option<String>,
    ) {
        let now = Utc::now();
        self.outcomes.push(StageOutcome {
            stage: name,
            passed,
            message: message.into(),
            revision,
            at: now,
        });
        self.stage = stage;
        self.updated_at = now;
    }

    pub fn mark_mutated(&mut self, env: &str) {
        if !self.mutated.iter().any(|m| m == env) {
            self.mutated.push(env.to_string());
        }
    }

    /// Whether validation passed within this record.
    pub fn validated(&self) -> bool {
        self.stage == PromotionStage::Validated
            && self.validation.as_ref().is_some_and(|v| v.passed)
    }

    pub fn last_outcome(&self) -> Option<&StageOutcome> {
        self.outcomes.last()
    }
}

/// `<dir>/<project>.json` holds the current record; every saved version
/// is also appended to `<dir>/<project>.history.jsonl`.
#[derive(Debug, Clone)]
pub struct PromotionStore {
    dir: PathBuf,
}

impl PromotionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}.json", project))
    }

    pub fn history_path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}.history.jsonl", project))
    }

    pub fn load(&self, project: &str) -> Result<Option<PromotionRecord>> {
        read_json(&self.path(project))
    }

    pub fn save(&self, record: &PromotionRecord) -> Result<()> {
        write_json_atomic(&self.path(&record.project), record)?;
        append_jsonl(&self.history_path(&record.project), record)
    }
}
