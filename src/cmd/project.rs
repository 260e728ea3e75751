//! Project retirement: `evolve archive`.

use anyhow::Result;
use std::path::Path;

use evolve::config::Config;
use evolve::orchestrator::JobStore;
use evolve::project::{Project, ProjectState, ProjectStatus, archive_project};

pub fn cmd_archive(config: &Config, path: &Path) -> Result<()> {
    let project = Project::load(path)?;
    let state = ProjectState::load(&project.root)?;
    if state.status == ProjectStatus::Running {
        anyhow::bail!(
            "Project {} has a running job; cancel it before archiving",
            project.name
        );
    }

    config.ensure_directories()?;
    let jobs = JobStore::new(config.jobs_dir());
    let job_record = state.last_job_id.as_deref().map(|id| jobs.job_path(id));
    let dest = archive_project(&project, &config.archive_dir(), job_record.as_deref())?;

    println!("Archived {} to {}", project.name, dest.display());
    Ok(())
}
