//! Escalation listing and resolution: `evolve escalations`.

use anyhow::Result;

use evolve::config::Config;
use evolve::controller::Resolution;
use evolve::orchestrator::JobEngine;

use super::super::EscalationCommands;

pub fn cmd_escalations(config: Config, command: Option<EscalationCommands>) -> Result<()> {
    let engine = JobEngine::from_config(config);

    match command {
        None => list(&engine, false),
        Some(EscalationCommands::List { open }) => list(&engine, open),
        Some(EscalationCommands::Resolve {
            job_id,
            phase_id,
            note,
        }) => {
            let record = engine.resolve_escalation(&job_id, &phase_id, note)?;
            println!(
                "Resolved escalation for phase {} of job {}",
                record.phase_id, record.job_id
            );
            println!("Resume with: evolve resume {}", record.job_id);
            Ok(())
        }
    }
}

fn list(engine: &JobEngine, open_only: bool) -> Result<()> {
    let records: Vec<_> = engine
        .escalations()?
        .into_iter()
        .filter(|r| !open_only || r.is_open())
        .collect();

    if records.is_empty() {
        println!("No escalations.");
        return Ok(());
    }

    for record in &records {
        let state = match &record.resolution {
            Resolution::Open => console::style("open".to_string()).red().bold(),
            Resolution::Resolved { resolved_at, .. } => console::style(format!(
                "resolved {}",
                resolved_at.format("%Y-%m-%d %H:%M")
            ))
            .green(),
        };
        println!();
        println!(
            "{} / {} ({}) - {}",
            record.job_id, record.phase_id, record.project, state
        );
        for attempt in &record.attempts {
            let reason = match (&attempt.gate_result, &attempt.error) {
                (_, Some(error)) => error.clone(),
                (Some(gate), None) => gate.summary(),
                (None, None) => "passed".to_string(),
            };
            let category = attempt
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "ok".to_string());
            println!("  attempt {} [{}]: {}", attempt.attempt, category, reason);
        }
        if let Resolution::Resolved {
            note: Some(note), ..
        } = &record.resolution
        {
            println!("  note: {}", note);
        }
    }
    println!();
    Ok(())
}
