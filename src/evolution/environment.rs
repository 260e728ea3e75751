//! Deployment environments backed by git working trees.
//!
//! Every environment is a git repository; revisions are commit ids. The
//! repository is opened per operation so no handle outlives a stage.

use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{Oid, Repository, ResetType, Signature};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::EnvironmentSettings;
use crate::errors::PipelineError;
use crate::project::Project;
use crate::sanitize::validate_relative_path;
use crate::util::tail_chars;

const BASELINE_REF: &str = "refs/evolve/baseline";
const RESTART_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub root: PathBuf,
    restart: Vec<String>,
}

impl Environment {
    pub fn new(name: &str, settings: &EnvironmentSettings) -> Self {
        Self {
            name: name.to_string(),
            root: settings.path.clone(),
            restart: settings.restart.clone(),
        }
    }

    fn repo(&self) -> Result<Repository, PipelineError> {
        Ok(Repository::open(&self.root)?)
    }

    /// Commit id at HEAD, or `None` for an unborn branch.
    pub fn head_revision(&self) -> Result<Option<String>, PipelineError> {
        let repo = self.repo()?;
        let head = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .map(|c| c.id().to_string());
        Ok(head)
    }

    /// Make this environment's tree exactly `source`'s current HEAD.
    ///
    /// Returns the synchronised revision.
    pub fn sync_to(&self, source: &Environment) -> Result<String, PipelineError> {
        let source_repo = source.repo()?;
        let source_head = source_repo.head()?;
        let branch = source_head
            .name()
            .filter(|n| n.starts_with("refs/heads/"))
            .ok_or_else(|| PipelineError::PreconditionFailed {
                stage: "deploy",
                reason: format!("{} environment HEAD is not on a branch", source.name),
            })?
            .to_string();
        let expected = source_head.peel_to_commit()?.id();
        drop(source_head);

        let repo = self.repo()?;
        let url = source.root.to_string_lossy().into_owned();
        let mut remote = repo.remote_anonymous(&url)?;
        remote.fetch(&[format!("+{}:{}", branch, BASELINE_REF)], None, None)?;
        let fetched = repo.refname_to_id(BASELINE_REF)?;
        if fetched != expected {
            return Err(PipelineError::StaleBaseline {
                expected: expected.to_string(),
                actual: fetched.to_string(),
            });
        }
        reset_to(&repo, fetched)?;
        tracing::info!(env = %self.name, from = %source.name, revision = %fetched, "Baseline synchronised");
        Ok(fetched.to_string())
    }

    /// Restore the tree to `revision`, discarding anything deployed since.
    pub fn reset_hard(&self, revision: &str) -> Result<(), PipelineError> {
        let repo = self.repo()?;
        reset_to(&repo, Oid::from_str(revision)?)?;
        tracing::info!(env = %self.name, revision = %revision, "Environment reset");
        Ok(())
    }

    /// Stage everything and commit. Returns the new revision.
    pub fn commit_all(&self, message: &str) -> Result<String, PipelineError> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("evolve", "evolve@localhost")?;

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(id.to_string())
    }

    /// Copy `artifacts` (destination-relative path -> source file) into the tree.
    pub fn install(&self, artifacts: &BTreeMap<PathBuf, PathBuf>) -> Result<(), PipelineError> {
        for (rel, source) in artifacts {
            let dest = self.root.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(source, &dest)
                .with_context(|| format!("Failed to copy {} into {}", rel.display(), self.name))?;
        }
        Ok(())
    }

    /// Run the configured restart command, if any.
    pub async fn restart(&self) -> Result<()> {
        let Some((program, args)) = self.restart.split_first() else {
            return Ok(());
        };
        let child = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start restart command for {}", self.name))?;
        let output = tokio::time::timeout(RESTART_TIMEOUT, child.wait_with_output())
            .await
            .with_context(|| format!("Restart of {} timed out", self.name))?
            .with_context(|| format!("Restart of {} failed", self.name))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "restart of {} exited with {:?}: {}",
                self.name,
                output.status.code(),
                tail_chars(stderr.trim(), 400)
            );
        }
        tracing::info!(env = %self.name, "Service restarted");
        Ok(())
    }
}

fn reset_to(repo: &Repository, oid: Oid) -> Result<(), PipelineError> {
    let target = repo.find_object(oid, None)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    if repo.head().is_ok() {
        repo.reset(&target, ResetType::Hard, Some(&mut checkout))?;
    } else {
        repo.set_head_detached(oid)?;
        repo.checkout_head(Some(&mut checkout))?;
    }
    Ok(())
}

/// Collect a project's produced files, in phase order.
///
/// Keys are project-relative destination paths; a later phase's file
/// replaces an earlier one, and `modified/` wins over `new/` within a phase.
pub fn collect_artifacts(project: &Project) -> Result<BTreeMap<PathBuf, PathBuf>, PipelineError> {
    let mut artifacts = BTreeMap::new();
    for phase in &project.phases {
        let layout = project.layout(&phase.id);
        for partition in [layout.new_dir(), layout.modified_dir()] {
            if !partition.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&partition).sort_by_file_name() {
                let entry = entry.context("Failed to walk phase output")?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&partition)
                    .context("Artifact outside its partition")?;
                let rel = validate_relative_path("artifact path", &rel.to_string_lossy())?;
                if rel.components().any(|c| c.as_os_str() == ".git") {
                    tracing::warn!(path = %rel.display(), "Skipping artifact inside .git");
                    continue;
                }
                artifacts.insert(rel, entry.path().to_path_buf());
            }
        }
    }
    Ok(artifacts)
}

/// Whether `root/rel` exists with exactly the bytes of `source`.
pub fn matches_artifact(root: &Path, rel: &Path, source: &Path) -> bool {
    match (std::fs::read(root.join(rel)), std::fs::read(source)) {
        (Ok(installed), Ok(expected)) => installed == expected,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Git fixtures shared with pipeline tests.

    use super::*;

    /// Initialise a repository at `path` with one commit holding `files`.
    pub fn init_repo(path: &Path, files: &[(&str, &str)]) -> String {
        std::fs::create_dir_all(path).unwrap();
        Repository::init(path).unwrap();
        let env = Environment::new(
            "fixture",
            &EnvironmentSettings {
                path: path.to_path_buf(),
                restart: Vec::new(),
            },
        );
        commit_files(&env, files)
    }

    pub fn commit_files(env: &Environment, files: &[(&str, &str)]) -> String {
        for (rel, content) in files {
            let path = env.root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        env.commit_all("fixture").unwrap()
    }
}
