//! Job inspection: `evolve status` and `evolve cancel`.

use anyhow::Result;

use evolve::config::Config;
use evolve::orchestrator::JobEngine;

use super::label;
use super::run::print_summary;

pub fn cmd_status(config: Config, job_id: Option<&str>, json: bool) -> Result<()> {
    let engine = JobEngine::from_config(config);

    if let Some(id) = job_id {
        let state = engine.status(id)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&state)?);
        } else {
            print_summary(&state);
        }
        return Ok(());
    }

    let jobs = engine.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs recorded in {}", engine.config().jobs_dir().display());
        return Ok(());
    }

    println!();
    println!(
        "{:<38} {:<20} {:<10} {:<20} Started",
        "Job", "Project", "Status", "Phase"
    );
    println!(
        "{:<38} {:<20} {:<10} {:<20} -------",
        "-".repeat(36),
        "-------",
        "------",
        "-----"
    );
    for job in &jobs {
        println!(
            "{:<38} {:<20} {:<10} {:<20} {}",
            job.job_id,
            job.project,
            label(&job.status),
            job.current_phase.as_deref().unwrap_or("-"),
            job.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_cancel(config: Config, job_id: &str) -> Result<()> {
    let engine = JobEngine::from_config(config);
    let state = engine.cancel(job_id)?;
    println!("Job {}: {}", state.job_id, label(&state.status));
    Ok(())
}
