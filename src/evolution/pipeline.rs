//! Staged promotion: deploy -> validate -> integrate, with rollback.
//!
//! Production is a single-writer resource: a second `integrate` while one
//! is in flight is rejected with [`PipelineError::ProductionBusy`]. Stages
//! touching the test environment queue behind each other.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use super::environment::{Environment, collect_artifacts, matches_artifact};
use super::record::{PromotionRecord, PromotionStage, PromotionStore, StageName};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::project::{Project, ProjectState, ProjectStatus};
use crate::sanitize::validate_identifier;
use crate::verify::test_suite::run_tests;
use crate::verify::{CheckOutcome, QualityGateResult};

pub const TEST_ENV: &str = "test";
pub const PRODUCTION_ENV: &str = "production";

/// Current pipeline position of a project.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub project: String,
    pub project_status: ProjectStatus,
    pub stage: PromotionStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<PromotionRecord>,
}

impl PromotionStage {
    /// Stage implied by a project status when no promotion has been recorded.
    pub fn for_project(status: ProjectStatus) -> Self {
        match status {
            ProjectStatus::Ready => Self::Ready,
            ProjectStatus::Deployed => Self::Deployed,
            ProjectStatus::Validated => Self::Validated,
            ProjectStatus::Integrated | ProjectStatus::Archived => Self::Integrated,
            ProjectStatus::RolledBack => Self::RolledBack,
            _ => Self::Developing,
        }
    }
}

pub struct EvolutionPipeline {
    projects_root: PathBuf,
    test: Option<Environment>,
    production: Option<Environment>,
    test_command: Vec<String>,
    test_timeout: Duration,
    store: PromotionStore,
    test_lock: Mutex<()>,
    production_lock: Mutex<()>,
}

impl EvolutionPipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            projects_root: config.server.projects_root.clone(),
            test: config
                .environments
                .test
                .as_ref()
                .map(|s| Environment::new(TEST_ENV, s)),
            production: config
                .environments
                .production
                .as_ref()
                .map(|s| Environment::new(PRODUCTION_ENV, s)),
            test_command: config.verification.test_command.clone(),
            test_timeout: Duration::from_secs(config.verification.test_timeout_secs),
            store: PromotionStore::new(config.promotions_dir()),
            test_lock: Mutex::new(()),
            production_lock: Mutex::new(()),
        }
    }

    fn environments(&self) -> Result<(&Environment, &Environment), PipelineError> {
        let test = self
            .test
            .as_ref()
            .ok_or_else(|| PipelineError::EnvironmentNotConfigured {
                name: TEST_ENV.into(),
            })?;
        let production =
            self.production
                .as_ref()
                .ok_or_else(|| PipelineError::EnvironmentNotConfigured {
                    name: PRODUCTION_ENV.into(),
                })?;
        Ok((test, production))
    }

    fn project_root(&self, name: &str) -> Result<PathBuf, PipelineError> {
        validate_identifier("project name", name)?;
        let root = self.projects_root.join(name);
        if !root.is_dir() {
            return Err(PipelineError::ProjectNotFound {
                name: name.to_string(),
            });
        }
        Ok(root)
    }

    fn load_project(&self, name: &str) -> Result<Project, PipelineError> {
        let root = self.project_root(name)?;
        Ok(Project::load(&root)?)
    }

    fn require_record(
        &self,
        name: &str,
        stage: &'static str,
    ) -> Result<PromotionRecord, PipelineError> {
        self.store
            .load(name)?
            .ok_or_else(|| PipelineError::PreconditionFailed {
                stage,
                reason: format!("project {} has not been deployed", name),
            })
    }

    pub fn status(&self, name: &str) -> Result<PipelineStatus, PipelineError> {
        let root = self.project_root(name)?;
        let project_status = ProjectState::load(&root)?.status;
        let record = self.store.load(name)?;
        let stage = record
            .as_ref()
            .map(|r| r.stage)
            .unwrap_or_else(|| PromotionStage::for_project(project_status));
        Ok(PipelineStatus {
            project: name.to_string(),
            project_status,
            stage,
            record,
        })
    }

    /// Synchronise the test baseline to production, then install the
    /// project's artifacts there and restart the test service.
    pub async fn deploy(&self, name: &str) -> Result<PromotionRecord, PipelineError> {
        let project = self.load_project(name)?;
        let state = ProjectState::load(&project.root)?;
        if !matches!(
            state.status,
            ProjectStatus::Ready
                | ProjectStatus::Deployed
                | ProjectStatus::Validated
                | ProjectStatus::RolledBack
        ) {
            return Err(PipelineError::PreconditionFailed {
                stage: "deploy",
                reason: format!(
                    "project {} is {:?}; its job must complete first",
                    name, state.status
                ),
            });
        }
        for dep in &project.depends_on {
            let dep_status = ProjectState::load(&self.projects_root.join(dep))?.status;
            if !matches!(dep_status, ProjectStatus::Integrated | ProjectStatus::Archived) {
                return Err(PipelineError::PreconditionFailed {
                    stage: "deploy",
                    reason: format!("dependency {} is {:?}, not integrated", dep, dep_status),
                });
            }
        }
        let (test, production) = self.environments()?;
        let artifacts = collect_artifacts(&project)?;
        if artifacts.is_empty() {
            return Err(PipelineError::PreconditionFailed {
                stage: "deploy",
                reason: "the project produced no artifacts".into(),
            });
        }
        let Some(baseline) = production.head_revision()? else {
            return Err(PipelineError::PreconditionFailed {
                stage: "deploy",
                reason: "production has no commits".into(),
            });
        };

        if let Some(current) = self.store.load(name)?
            && current.mutated.iter().any(|m| m == PRODUCTION_ENV)
        {
            return Err(PipelineError::PreconditionFailed {
                stage: "deploy",
                reason: format!(
                    "promotion {} left production modified; roll it back first",
                    current.id
                ),
            });
        }

        let _guard = self.test_lock.lock().await;
        let mut record = PromotionRecord::new(
            name,
            state.last_job_id.clone(),
            test.root.clone(),
            production.root.clone(),
        );
        record.artifacts = artifacts.keys().cloned().collect();
        if let Some(previous) = test.head_revision()? {
            record.last_known_good.insert(TEST_ENV.into(), previous);
        }

        let synced = test.sync_to(production)?;
        record.baseline = Some(synced);
        record.mark_mutated(TEST_ENV);

        let installed = test.install(&artifacts).and_then(|()| {
            test.commit_all(&format!("evolve: deploy {} ({} files)", name, artifacts.len()))
        });
        let revision = match installed {
            Ok(rev) => rev,
            Err(e) => {
                record.record(
                    StageName::Deploy,
                    PromotionStage::Failed,
                    false,
                    e.to_string(),
                    None,
                );
                self.store.save(&record)?;
                tracing::error!(project = %name, error = %e, "Deploy failed");
                return Ok(record);
            }
        };
        if let Err(e) = test.restart().await {
            record.record(
                StageName::Deploy,
                PromotionStage::Failed,
                false,
                format!("{:#}", e),
                Some(revision),
            );
            self.store.save(&record)?;
            tracing::error!(project = %name, error = %e, "Deploy failed");
            return Ok(record);
        }

        // Only a fully restarted deploy can be validated.
        record.deployed_revision = Some(revision.clone());
        record.record(
            StageName::Deploy,
            PromotionStage::Deployed,
            true,
            format!("deployed {} files", artifacts.len()),
            Some(revision),
        );
        self.store.save(&record)?;
        ProjectState::set(&project.root, ProjectStatus::Deployed, None)?;
        tracing::info!(project = %name, files = artifacts.len(), "Deployed to test environment");
        Ok(record)
    }

    /// Run the verification suite against the deployed test environment.
    ///
    /// Does not modify either environment; repeated runs against an
    /// unchanged deployment give the same result.
    pub async fn validate(&self, name: &str) -> Result<PromotionRecord, PipelineError> {
        let project = self.load_project(name)?;
        let (test, _) = self.environments()?;
        let mut record = self.require_record(name, "validate")?;
        let Some(deployed) = record.deployed_revision.clone() else {
            return Err(PipelineError::PreconditionFailed {
                stage: "validate",
                reason: "the last deploy did not complete".into(),
            });
        };
        let revalidating = record.stage == PromotionStage::Failed
            && record
                .last_outcome()
                .is_some_and(|o| o.stage == StageName::Validate);
        if !matches!(
            record.stage,
            PromotionStage::Deployed | PromotionStage::Validated
        ) && !revalidating
        {
            return Err(PipelineError::PreconditionFailed {
                stage: "validate",
                reason: format!("promotion is {:?}, not deployed", record.stage),
            });
        }

        let _guard = self.test_lock.lock().await;
        let head = test.head_revision()?;
        if head.as_deref() != Some(deployed.as_str()) {
            return Err(PipelineError::PreconditionFailed {
                stage: "validate",
                reason: "the test environment changed since deploy".into(),
            });
        }

        let artifacts = collect_artifacts(&project)?;
        let mut checks = artifact_checks(&test.root, &artifacts);
        checks.push(run_tests(&self.test_command, &test.root, self.test_timeout).await);
        let result =
            QualityGateResult::from_checks(vec!["artifacts".into(), "tests_pass".into()], checks);
        let passed = result.passed;
        let summary = result.summary();
        record.validation = Some(result);

        if passed {
            record.record(
                StageName::Validate,
                PromotionStage::Validated,
                true,
                summary,
                Some(deployed),
            );
            self.store.save(&record)?;
            ProjectState::set(&project.root, ProjectStatus::Validated, None)?;
            tracing::info!(project = %name, "Validation passed");
        } else {
            record.record(
                StageName::Validate,
                PromotionStage::Failed,
                false,
                summary.clone(),
                Some(deployed),
            );
            self.store.save(&record)?;
            tracing::warn!(project = %name, summary = %summary, "Validation failed");
        }
        Ok(record)
    }

    /// Install the validated artifact set into production.
    pub async fn integrate(&self, name: &str) -> Result<PromotionRecord, PipelineError> {
        let _production = self
            .production_lock
            .try_lock()
            .map_err(|_| PipelineError::ProductionBusy)?;
        let project = self.load_project(name)?;
        let (_, production) = self.environments()?;
        let mut record = self.require_record(name, "integrate")?;
        if !record.validated() {
            return Err(PipelineError::PreconditionFailed {
                stage: "integrate",
                reason: "this promotion has no passing validation".into(),
            });
        }

        let current = production.head_revision()?.unwrap_or_default();
        let baseline = record.baseline.clone().unwrap_or_default();
        if current != baseline {
            return Err(PipelineError::StaleBaseline {
                expected: baseline,
                actual: current,
            });
        }

        let artifacts = collect_artifacts(&project)?;
        let expected: Vec<PathBuf> = artifacts.keys().cloned().collect();
        if expected != record.artifacts {
            return Err(PipelineError::PreconditionFailed {
                stage: "integrate",
                reason: "artifacts changed since validation; redeploy".into(),
            });
        }

        record
            .last_known_good
            .insert(PRODUCTION_ENV.into(), current.clone());
        record.mark_mutated(PRODUCTION_ENV);

        let installed = production.install(&artifacts).and_then(|()| {
            production.commit_all(&format!("evolve: integrate {} ({} files)", name, artifacts.len()))
        });
        let revision = match installed {
            Ok(rev) => rev,
            Err(e) => {
                record.record(
                    StageName::Integrate,
                    PromotionStage::Failed,
                    false,
                    e.to_string(),
                    None,
                );
                self.store.save(&record)?;
                tracing::error!(project = %name, error = %e, "Integration failed");
                return Ok(record);
            }
        };
        record.integrated_revision = Some(revision.clone());

        if let Err(e) = production.restart().await {
            record.record(
                StageName::Integrate,
                PromotionStage::Failed,
                false,
                format!("{:#}", e),
                Some(revision),
            );
            self.store.save(&record)?;
            tracing::error!(project = %name, error = %e, "Integration failed");
            return Ok(record);
        }

        record.record(
            StageName::Integrate,
            PromotionStage::Integrated,
            true,
            format!("integrated {} files", artifacts.len()),
            Some(revision),
        );
        // Production now holds this revision; nothing left to roll back.
        record.mutated.clear();
        self.store.save(&record)?;
        ProjectState::set(&project.root, ProjectStatus::Integrated, None)?;
        tracing::info!(project = %name, "Integrated into production");
        Ok(record)
    }

    /// Restore every environment this promotion changed to its last-known-good revision.
    pub async fn rollback(&self, name: &str) -> Result<PromotionRecord, PipelineError> {
        let project = self.load_project(name)?;
        let mut record = self.require_record(name, "rollback")?;
        if record.mutated.is_empty() {
            return Err(PipelineError::PreconditionFailed {
                stage: "rollback",
                reason: "no environment has pending changes from this promotion".into(),
            });
        }

        let _test = self.test_lock.lock().await;
        let _production = if record.mutated.iter().any(|m| m == PRODUCTION_ENV) {
            Some(
                self.production_lock
                    .try_lock()
                    .map_err(|_| PipelineError::ProductionBusy)?,
            )
        } else {
            None
        };

        let mut restored = Vec::new();
        for env_name in record.mutated.clone() {
            let env = self.environment_named(&env_name)?;
            let Some(revision) = record.last_known_good.get(&env_name).cloned() else {
                tracing::warn!(env = %env_name, "No last-known-good revision; leaving as is");
                continue;
            };
            env.reset_hard(&revision)?;
            if let Err(e) = env.restart().await {
                tracing::warn!(env = %env_name, error = %e, "Restart after rollback failed");
            }
            restored.push(format!("{}@{}", env_name, short_rev(&revision)));
        }

        record.mutated.clear();
        record.record(
            StageName::Rollback,
            PromotionStage::RolledBack,
            true,
            format!("restored {}", restored.join(", ")),
            None,
        );
        self.store.save(&record)?;
        ProjectState::set(&project.root, ProjectStatus::RolledBack, None)?;
        tracing::info!(project = %name, restored = ?restored, "Rolled back");
        Ok(record)
    }

    fn environment_named(&self, name: &str) -> Result<&Environment, PipelineError> {
        let env = match name {
            TEST_ENV => self.test.as_ref(),
            PRODUCTION_ENV => self.production.as_ref(),
            _ => None,
        };
        env.ok_or_else(|| PipelineError::EnvironmentNotConfigured {
            name: name.to_string(),
        })
    }
}

fn artifact_checks(root: &Path, artifacts: &BTreeMap<PathBuf, PathBuf>) -> Vec<CheckOutcome> {
    artifacts
        .iter()
        .map(|(rel, source)| {
            let subject = Some(rel.display().to_string());
            if matches_artifact(root, rel, source) {
                CheckOutcome::pass("artifacts", subject, "installed")
            } else {
                CheckOutcome::fail(
                    "artifacts",
                    subject,
                    "missing or different from the phase output",
                )
            }
        })
        .collect()
}

fn short_rev(rev: &str) -> &str {
    rev.get(..8).unwrap_or(rev)
}
