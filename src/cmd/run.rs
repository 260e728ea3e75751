//! Foreground job execution: `evolve run` and `evolve resume`.

use anyhow::Result;
use futures::StreamExt;
use std::path::Path;

use evolve::config::Config;
use evolve::controller::PhaseStatus;
use evolve::orchestrator::{JobEngine, JobState, JobStatus};
use evolve::stream::{AgentEvent, JobEvent};

use super::label;

/// How job events are written to stdout.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub quiet: bool,
    pub json: bool,
}

impl OutputMode {
    pub fn new(quiet: bool, json: bool) -> Self {
        Self { quiet, json }
    }
}

pub async fn cmd_run(config: Config, project: &Path, mode: OutputMode) -> Result<()> {
    config.ensure_directories()?;
    let engine = JobEngine::from_config(config);
    let job_id = engine.start(project).await?;
    if !mode.json {
        println!("Started job {}", console::style(&job_id).bold());
    }
    follow(&engine, &job_id, mode).await
}

pub async fn cmd_resume(
    config: Config,
    job_id: &str,
    from_phase: Option<&str>,
    reset: bool,
    mode: OutputMode,
) -> Result<()> {
    config.ensure_directories()?;
    let engine = JobEngine::from_config(config);
    engine.resume(job_id, from_phase, reset).await?;
    if !mode.json {
        println!("Resumed job {}", console::style(job_id).bold());
    }
    follow(&engine, job_id, mode).await
}

/// Print events until the job finishes. Ctrl+C cancels the job.
async fn follow(engine: &JobEngine, job_id: &str, mode: OutputMode) -> Result<()> {
    let events = engine.stream(job_id)?;
    let drain = async {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            if mode.quiet {
                continue;
            }
            if mode.json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode job event"),
                }
            } else {
                print_event(&event);
            }
        }
    };

    tokio::select! {
        _ = drain => {}
        signal = tokio::signal::ctrl_c() => {
            if signal.is_ok() {
                eprintln!("\nCancelling job {}...", job_id);
                engine.cancel(job_id)?;
            }
        }
    }

    let state = engine.wait_for_completion(job_id).await?;
    if !mode.json {
        print_summary(&state);
    }
    match state.status {
        JobStatus::Completed => Ok(()),
        status => anyhow::bail!("Job {} finished with status {}", job_id, label(&status)),
    }
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::JobStarted { project, phases, .. } => {
            println!("Project {}: {}", project, phases.join(" -> "));
        }
        JobEvent::PhaseStart {
            phase_id, attempt, ..
        } => {
            println!(
                "{} {} (attempt {})",
                console::style("▶").cyan(),
                console::style(phase_id).bold(),
                attempt
            );
        }
        JobEvent::PhaseStatus { phase_id, status } => {
            if *status == PhaseStatus::Verifying {
                println!("  {}", console::style(format!("{}: verifying", phase_id)).dim());
            }
        }
        JobEvent::OutputLine { event, .. } => match event {
            AgentEvent::ToolUse { description, .. } => {
                println!("  {} {}", console::style("⚙").dim(), description);
            }
            AgentEvent::Text { text } => {
                if let Some(first) = text.lines().find(|l| !l.trim().is_empty()) {
                    let line: String = first.chars().take(120).collect();
                    println!("  {}", console::style(line).dim());
                }
            }
            AgentEvent::Result {
                is_error,
                cost_usd,
                ..
            } => {
                let cost = cost_usd.map(|c| format!(" (${:.4})", c)).unwrap_or_default();
                if *is_error {
                    println!("  {}{}", console::style("agent reported an error").red(), cost);
                } else {
                    println!("  {}{}", console::style("agent finished").dim(), cost);
                }
            }
            AgentEvent::Unknown { .. } => {}
        },
        JobEvent::AttemptFailed {
            phase_id,
            attempt,
            category,
            summary,
        } => {
            println!(
                "  {} {} attempt {} failed ({}): {}",
                console::style("✗").yellow(),
                phase_id,
                attempt,
                category,
                summary
            );
        }
        JobEvent::PhaseComplete {
            phase_id,
            status,
            attempts,
        } => {
            let mark = if *status == PhaseStatus::Completed {
                console::style("✓").green()
            } else {
                console::style("✗").red()
            };
            println!(
                "{} {} {} after {} attempt(s)",
                mark,
                phase_id,
                label(status),
                attempts
            );
        }
        JobEvent::Escalated { phase_id, attempts } => {
            println!(
                "{} phase {} escalated after {} attempts",
                console::style("Escalated:").red().bold(),
                phase_id,
                attempts
            );
        }
        JobEvent::JobComplete { .. } => {}
    }
}

pub(crate) fn print_summary(state: &JobState) {
    let status = label(&state.status);
    let styled = match state.status {
        JobStatus::Completed => console::style(status).green().bold(),
        JobStatus::Running | JobStatus::Queued => console::style(status).cyan(),
        _ => console::style(status).red().bold(),
    };
    println!();
    println!("Job {} ({}): {}", state.job_id, state.project, styled);
    for phase in &state.phases {
        println!(
            "  {:<24} {:<10} {} attempt(s)",
            phase.id,
            label(&phase.status),
            phase.attempts.len()
        );
    }
    println!(
        "  agent time {:.1}s, cost ${:.4}, {} output lines",
        state.usage.agent_ms as f64 / 1000.0,
        state.usage.cost_usd,
        state.usage.output_lines
    );
    if let Some(failure) = &state.last_failure {
        println!(
            "  last failure [{}]{}: {}",
            failure.category,
            failure
                .phase_id
                .as_deref()
                .map(|p| format!(" in {}", p))
                .unwrap_or_default(),
            failure.message
        );
    }
}
